//! Store synchronization for the scanner: startup cache seeding and the
//! per-path transactional sync.

use super::cache::{
    BaseState, FileCache, PathCache, UP_FILE_CT, UP_FILE_HS, UP_FILE_TS, UP_PATH_TG, UP_PATH_TS,
    UP_SIDE_TG, UP_SIDE_TS,
};
use super::{CheckRun, Inner};
use crate::error::{Error, Result};
use crate::tags::TagSet;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info, warn};

impl Inner {
    /// Seeds the in-memory tree from the store; called once at startup,
    /// replacing whatever the cache holds.
    pub(super) async fn load_cache(&self) -> Result<()> {
        let co = self.get_conf()?;
        let pool = self
            .db
            .get()
            .ok_or_else(|| Error::Transient("no pool".into()))?;

        for cb in co.bases.values() {
            let Some(bc) = self.base(cb.base) else {
                continue;
            };
            let mut state = bc.state.lock().await;
            state.paths.clear();

            let path_rows = sqlx::query(&co.queries.paths_select)
                .bind(cb.base)
                .fetch_all(pool.as_ref())
                .await?;
            for row in path_rows {
                let id: i64 = row.try_get(0)?;
                let name: String = row.try_get(1)?;
                let pathts: i64 = row.try_get(2)?;
                let _sidets: i64 = row.try_get(3)?;
                let tags: String = row.try_get(4)?;
                state.paths.insert(
                    name.clone(),
                    PathCache {
                        id,
                        path: name,
                        changed_ts: pathts,
                        // Left at zero so the first pass reparses any
                        // tag file; the stored tags column holds the
                        // effective set, which the reparse rebuilds.
                        side_ts: 0,
                        tags: TagSet::from(storage::decode_tags(&tags)),
                        ..Default::default()
                    },
                );
            }

            let keys: Vec<String> = state.paths.keys().cloned().collect();
            for key in keys {
                let pid = state.paths[&key].id;
                let file_rows = sqlx::query(&co.queries.files_select)
                    .bind(pid)
                    .fetch_all(pool.as_ref())
                    .await?;
                let pc = state.paths.get_mut(&key).expect("key from map");
                for row in file_rows {
                    let id: i64 = row.try_get(0)?;
                    let name: String = row.try_get(1)?;
                    let filets: i64 = row.try_get(2)?;
                    let hash: String = row.try_get(3)?;
                    let sidets: i64 = row.try_get(4)?;
                    let sidetags: String = row.try_get(5)?;
                    let tags: String = row.try_get(6)?;
                    pc.files.insert(
                        name.clone(),
                        FileCache {
                            id,
                            name,
                            file_ts: filets,
                            side_ts: sidets,
                            hash,
                            side_tags: TagSet::from(storage::decode_tags(&sidetags)),
                            ctags: TagSet::from(storage::decode_tags(&tags)),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        debug!("cache loaded from store");
        Ok(())
    }

    /// Pushes one dirty path and its files to the store in a single
    /// transaction. Update bits clear only after the commit, so a store
    /// failure leaves everything marked for the next pass.
    pub(super) async fn update_db_pf(
        &self,
        cr: &CheckRun,
        state: &mut BaseState,
        key: &str,
        loop_n: u32,
    ) -> Result<()> {
        // An unobserved path syncs regardless of its bits; disabling it
        // (and its files) is exactly the pending change.
        let dirty = state
            .paths
            .get(key)
            .map(|pc| pc.updated != 0 || pc.loop_n != loop_n)
            .unwrap_or(false);
        if !dirty {
            return Ok(());
        }
        let pool = self
            .db
            .get()
            .ok_or_else(|| Error::Transient("no pool".into()))?;
        let mut tx = pool.begin().await?;

        let pc = state.paths.get_mut(key).expect("caller checked");
        Self::update_db_path(&mut tx, cr, pc, loop_n).await?;
        let pid = pc.id;
        let names: Vec<String> = pc.files.keys().cloned().collect();
        for name in &names {
            let fc = pc.files.get_mut(name).expect("name from map");
            self.update_db_file(&mut tx, cr, pid, fc, loop_n).await?;
        }

        tx.commit().await?;

        // Committed; now the changed flags can go.
        pc.updated = 0;
        for fc in pc.files.values_mut() {
            fc.updated = 0;
        }
        Ok(())
    }

    /// Path row table-of-states: unseen+id disables, seen without an id
    /// inserts, a seen dirty row updates. A path only earns a row once
    /// it holds at least one insertable file.
    async fn update_db_path(
        tx: &mut Transaction<'_, Sqlite>,
        cr: &CheckRun,
        pc: &mut PathCache,
        loop_n: u32,
    ) -> Result<()> {
        if pc.loop_n != loop_n {
            if pc.id == 0 {
                // Never persisted (a directory with no images); just
                // mark it so the sweep removes it.
                pc.disabled = true;
                return Ok(());
            }
            if pc.disabled {
                warn!(path = pc.path, "already disabled yet unseen");
                return Ok(());
            }
            sqlx::query(&cr.queries.paths_disable)
                .bind(pc.id)
                .execute(&mut **tx)
                .await?;
            pc.disabled = true;
            return Ok(());
        }

        if pc.id == 0 {
            let insertable = pc
                .files
                .values()
                .any(|fc| fc.loop_f == loop_n && !fc.ctags.is_empty());
            if !insertable {
                return Ok(());
            }
            let pid: i64 = sqlx::query_scalar(&cr.queries.paths_insert)
                .bind(cr.cb.base)
                .bind(&pc.path)
                .bind(pc.changed_ts)
                .bind(pc.side_ts)
                .bind(storage::encode_tags(pc.eff_tags().as_slice()))
                .fetch_one(&mut **tx)
                .await?;
            pc.id = pid;
            debug!(path = pc.path, pid, "path inserted");
        } else if pc.updated & (UP_PATH_TG | UP_PATH_TS) != 0 {
            sqlx::query(&cr.queries.paths_update)
                .bind(pc.id)
                .bind(pc.changed_ts)
                .bind(pc.side_ts)
                .bind(storage::encode_tags(pc.eff_tags().as_slice()))
                .execute(&mut **tx)
                .await?;
            info!(path = pc.path, "path updated");
        }
        Ok(())
    }

    /// File row table-of-states. A file with empty combined tags is
    /// never written; one in the error state is left untouched.
    async fn update_db_file(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        cr: &CheckRun,
        pid: i64,
        fc: &mut FileCache,
        loop_n: u32,
    ) -> Result<()> {
        if fc.ctags.is_empty() && fc.loop_f == loop_n {
            warn!(file = fc.name, "has no tags");
            return Ok(());
        }

        if fc.loop_f != loop_n {
            if fc.id == 0 {
                if fc.loop_s == loop_n {
                    // A sidecar without its image. Mark it so the sweep
                    // removes the entry; nothing to do in the store.
                    fc.disabled = true;
                    return Ok(());
                }
                // Disappeared before it ever earned a row.
                warn!(file = fc.name, "unseen with no id");
                fc.disabled = true;
                return Ok(());
            }
            if fc.disabled {
                warn!(file = fc.name, "already disabled yet unseen");
                return Ok(());
            }
            sqlx::query(&cr.queries.files_disable)
                .bind(fc.id)
                .execute(&mut **tx)
                .await?;
            fc.disabled = true;
            info!(file = fc.name, "file disabled");
            return Ok(());
        }

        if fc.file_error {
            return Ok(());
        }

        if fc.id == 0 {
            let hid = self.hm.get_id(&fc.hash).await? as i64;
            let fid: i64 = sqlx::query_scalar(&cr.queries.files_insert)
                .bind(pid)
                .bind(&fc.name)
                .bind(fc.file_ts)
                .bind(fc.side_ts)
                .bind(storage::encode_tags(fc.side_tags.as_slice()))
                .bind(hid)
                .bind(storage::encode_tags(fc.ctags.as_slice()))
                .fetch_one(&mut **tx)
                .await?;
            fc.id = fid;
            debug!(file = fc.name, fid, "file inserted");
        } else if fc.updated & (UP_FILE_TS | UP_FILE_CT | UP_FILE_HS | UP_SIDE_TS | UP_SIDE_TG) != 0
        {
            let hid = self.hm.get_id(&fc.hash).await? as i64;
            sqlx::query(&cr.queries.files_update)
                .bind(fc.id)
                .bind(fc.file_ts)
                .bind(fc.side_ts)
                .bind(storage::encode_tags(fc.side_tags.as_slice()))
                .bind(hid)
                .bind(storage::encode_tags(fc.ctags.as_slice()))
                .execute(&mut **tx)
                .await?;
            info!(file = fc.name, "file updated");
        }
        Ok(())
    }
}
