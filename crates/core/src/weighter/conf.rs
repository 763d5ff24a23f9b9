//! Weighter configuration: profiles with match rules and weight maps.

use crate::confwatch::parse_duration;
use crate::error::{Error, Result};
use crate::tags::{
    self, ConfTagRule, ConfTagWeights, TagRule, TagRules, TagSource, TagWeights,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) const MIN_POLL_INT: Duration = Duration::from_secs(1);
pub(crate) const MIN_FULL_INT: Duration = Duration::from_secs(60);

pub(crate) const UC_DB_CONN: u64 = 1 << 0;
pub(crate) const UC_DB_QUERY: u64 = 1 << 1;
pub(crate) const UC_TAG_RULES: u64 = 1 << 2;
pub(crate) const UC_PROFILES: u64 = 1 << 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightQueries {
    pub full: String,
    pub poll: String,
}

impl WeightQueries {
    pub(crate) fn prepare_list(&self) -> Vec<String> {
        vec![self.full.clone(), self.poll.clone()]
    }
}

/// A named selection profile: a match rule gating inclusion (absent
/// means every image matches) and the weight map scoring it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfProfile {
    pub name: String,
    pub matches: Option<TagRule>,
    pub weights: TagWeights,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conf {
    pub database: String,
    pub queries: WeightQueries,
    pub tag_rules: TagRules,
    pub profiles: HashMap<String, ConfProfile>,
    pub poll_int: Duration,
    pub full_int: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawQueries {
    #[serde(default)]
    full: String,
    #[serde(default)]
    poll: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawProfile {
    #[serde(default)]
    any: Vec<String>,
    #[serde(default)]
    all: Vec<String>,
    #[serde(default)]
    none: Vec<String>,
    #[serde(default)]
    weights: ConfTagWeights,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawConf {
    #[serde(default)]
    database: String,
    #[serde(default)]
    queries: Option<RawQueries>,
    #[serde(default, rename = "profile")]
    profiles: HashMap<String, RawProfile>,
    #[serde(default)]
    tagrules: Vec<ConfTagRule>,
    #[serde(default)]
    pollinterval: String,
    #[serde(default)]
    fullinterval: String,
}

pub(crate) async fn convert(raw: RawConf, tm: &dyn TagSource) -> Result<Conf> {
    let mut out = Conf {
        database: raw.database,
        queries: WeightQueries::default(),
        tag_rules: TagRules::new(),
        profiles: HashMap::new(),
        poll_int: Duration::ZERO,
        full_int: Duration::ZERO,
    };

    if let Some(q) = raw.queries {
        out.queries = WeightQueries {
            full: q.full,
            poll: q.poll,
        };
    }
    if !raw.tagrules.is_empty() {
        out.tag_rules = tags::rules_from_conf(&raw.tagrules, tm).await?;
    }
    for (name, prof) in raw.profiles {
        let matches = tags::match_rule_from_conf(&prof.any, &prof.all, &prof.none, tm).await?;
        let weights = tags::weights_from_conf(&prof.weights, tm).await?;
        out.profiles.insert(
            name.clone(),
            ConfProfile {
                name,
                matches,
                weights,
            },
        );
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
    if !next.queries.full.is_empty() {
        acc.queries.full = next.queries.full;
    }
    if !next.queries.poll.is_empty() {
        acc.queries.poll = next.queries.poll;
    }
    if !next.tag_rules.is_empty() {
        acc.tag_rules = acc.tag_rules.combine(&next.tag_rules);
    }
    for (name, prof) in next.profiles {
        match acc.profiles.get_mut(&name) {
            None => {
                acc.profiles.insert(name, prof);
            }
            Some(existing) => {
                existing.weights = existing.weights.clone().combine(&prof.weights);
                if prof.matches.is_some() {
                    existing.matches = prof.matches;
                }
            }
        }
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
    if conf.queries.full.is_empty() {
        return Err(Error::Config("missing queries.full".into()));
    }
    if conf.queries.poll.is_empty() {
        return Err(Error::Config("missing queries.poll".into()));
    }
    if conf.poll_int < MIN_POLL_INT {
        return Err(Error::Config("pollinterval missing or too short".into()));
    }
    if conf.full_int < MIN_FULL_INT {
        return Err(Error::Config("fullinterval missing or too short".into()));
    }
    if conf.profiles.is_empty() {
        return Err(Error::Config("need at least one profile".into()));
    }
    for prof in conf.profiles.values() {
        if prof.weights.is_empty() {
            return Err(Error::Config(format!(
                "profile {:?} has no weights",
                prof.name
            )));
        }
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
    if conf.profiles != prev.profiles {
        bits |= UC_PROFILES;
    }
    Ok(bits)
}
