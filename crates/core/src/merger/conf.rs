//! Merger configuration.

use crate::confwatch::parse_duration;
use crate::error::{Error, Result};
use crate::tags::{self, ConfTagRule, TagRules, TagSet, TagSource};
use serde::Deserialize;
use std::time::Duration;

pub(crate) const MIN_POLL_INT: Duration = Duration::from_secs(1);
pub(crate) const MIN_FULL_INT: Duration = Duration::from_secs(60);

pub(crate) const UC_DB_CONN: u64 = 1 << 0;
pub(crate) const UC_DB_QUERY: u64 = 1 << 1;
pub(crate) const UC_TAG_RULES: u64 = 1 << 2;
pub(crate) const UC_BLOCK_TAGS: u64 = 1 << 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeQueries {
    pub full: String,
    pub poll: String,
    pub select: String,
    pub insert: String,
    pub update: String,
    pub disable: String,
}

impl MergeQueries {
    pub(crate) fn prepare_list(&self) -> Vec<String> {
        vec![
            self.full.clone(),
            self.poll.clone(),
            self.select.clone(),
            self.insert.clone(),
            self.update.clone(),
            self.disable.clone(),
        ]
    }

    fn merge_from(&mut self, other: &MergeQueries) {
        fn take(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        take(&mut self.full, &other.full);
        take(&mut self.poll, &other.poll);
        take(&mut self.select, &other.select);
        take(&mut self.insert, &other.insert);
        take(&mut self.update, &other.update);
        take(&mut self.disable, &other.disable);
    }

    fn check(&self) -> Result<()> {
        for (name, sql) in [
            ("full", &self.full),
            ("poll", &self.poll),
            ("select", &self.select),
            ("insert", &self.insert),
            ("update", &self.update),
            ("disable", &self.disable),
        ] {
            if sql.is_empty() {
                return Err(Error::Config(format!("missing queries.{name}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conf {
    pub database: String,
    pub queries: MergeQueries,
    pub tag_rules: TagRules,
    pub block_tags: TagSet,
    pub poll_int: Duration,
    pub full_int: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawQueries {
    #[serde(default)]
    full: String,
    #[serde(default)]
    poll: String,
    #[serde(default)]
    select: String,
    #[serde(default)]
    insert: String,
    #[serde(default)]
    update: String,
    #[serde(default)]
    disable: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawConf {
    #[serde(default)]
    database: String,
    #[serde(default)]
    queries: Option<RawQueries>,
    #[serde(default)]
    tagrules: Vec<ConfTagRule>,
    #[serde(default)]
    blocktags: Vec<String>,
    #[serde(default)]
    pollinterval: String,
    #[serde(default)]
    fullinterval: String,
}

pub(crate) async fn convert(raw: RawConf, tm: &dyn TagSource) -> Result<Conf> {
    let mut out = Conf {
        database: raw.database,
        queries: MergeQueries::default(),
        tag_rules: TagRules::new(),
        block_tags: TagSet::new(),
        poll_int: Duration::ZERO,
        full_int: Duration::ZERO,
    };

    if let Some(q) = raw.queries {
        out.queries = MergeQueries {
            full: q.full,
            poll: q.poll,
            select: q.select,
            insert: q.insert,
            update: q.update,
            disable: q.disable,
        };
    }
    if !raw.blocktags.is_empty() {
        out.block_tags = tags::strings_to_tags(&raw.blocktags, tm).await?;
    }
    if !raw.tagrules.is_empty() {
        out.tag_rules = tags::rules_from_conf(&raw.tagrules, tm).await?;
    }
    if !raw.pollinterval.is_empty() {
        out.poll_int = parse_duration(&raw.pollinterval)?;
        if out.poll_int < MIN_POLL_INT {
            return Err(Error::Config("pollinterval too short".into()));
        }
    }
    if !raw.fullinterval.is_empty() {
        out.full_int = parse_duration(&raw.fullinterval)?;
        if out.full_int < MIN_FULL_INT {
            return Err(Error::Config("fullinterval too short".into()));
        }
    }
    Ok(out)
}

pub(crate) fn merge(mut acc: Conf, next: Conf) -> Result<Conf> {
    if !next.database.is_empty() {
        acc.database = next.database;
    }
    acc.queries.merge_from(&next.queries);
    if !next.block_tags.is_empty() {
        acc.block_tags = acc.block_tags.combine(&next.block_tags);
    }
    if !next.tag_rules.is_empty() {
        acc.tag_rules = acc.tag_rules.combine(&next.tag_rules);
    }
    if next.poll_int > Duration::ZERO {
        acc.poll_int = next.poll_int;
    }
    if next.full_int > Duration::ZERO {
        acc.full_int = next.full_int;
    }
    Ok(acc)
}

pub(crate) fn check(conf: &Conf, prev: Option<&Conf>) -> Result<u64> {
    if conf.database.is_empty() {
        return Err(Error::Config("missing database".into()));
    }
    conf.queries.check()?;
    if conf.poll_int < MIN_POLL_INT {
        return Err(Error::Config("pollinterval missing or too short".into()));
    }
    if conf.full_int < MIN_FULL_INT {
        return Err(Error::Config("fullinterval missing or too short".into()));
    }

    let Some(prev) = prev else {
        return Ok(0);
    };
    let mut bits = 0u64;
    if conf.database != prev.database {
        bits |= UC_DB_CONN;
    }
    if conf.queries != prev.queries {
        bits |= UC_DB_QUERY;
    }
    if conf.tag_rules != prev.tag_rules {
        bits |= UC_TAG_RULES;
    }
    if conf.block_tags != prev.block_tags {
        bits |= UC_BLOCK_TAGS;
    }
    Ok(bits)
}
