//! Default query text for the reference schema.
//!
//! Deployments override any of these strings in stage configuration; the
//! constants here are what a stock install and the test suite run with.
//! Bind positions are part of each stage's contract and documented next
//! to the statement.

// Scanner: paths table.
// select: ?1 = bid -> (pid, name, pathts, sidets, tags)
pub const PATHS_SELECT: &str =
    "SELECT pid, name, pathts, sidets, tags FROM paths WHERE bid = ?1 AND enabled";
// insert: ?1 = bid, ?2 = name, ?3 = pathts, ?4 = sidets, ?5 = tags -> pid
pub const PATHS_INSERT: &str = "INSERT INTO paths (bid, name, pathts, sidets, tags) \
     VALUES (?1, ?2, ?3, ?4, ?5) \
     ON CONFLICT (bid, name) DO UPDATE SET \
       pathts = excluded.pathts, sidets = excluded.sidets, tags = excluded.tags, enabled = 1 \
     RETURNING pid";
// update: ?1 = pid, ?2 = pathts, ?3 = sidets, ?4 = tags
pub const PATHS_UPDATE: &str =
    "UPDATE paths SET pathts = ?2, sidets = ?3, tags = ?4 WHERE pid = ?1";
// disable: ?1 = pid
pub const PATHS_DISABLE: &str = "UPDATE paths SET enabled = 0 WHERE pid = ?1";

// Scanner: files table.
// select: ?1 = pid -> (fid, name, filets, hash, sidets, sidetags, tags)
pub const FILES_SELECT: &str = "SELECT f.fid, f.name, f.filets, COALESCE(h.hash, ''), f.sidets, f.sidetags, f.tags \
     FROM files f LEFT JOIN hashes h ON h.hid = f.hid \
     WHERE f.pid = ?1 AND f.enabled";
// insert: ?1 = pid, ?2 = name, ?3 = filets, ?4 = sidets, ?5 = sidetags, ?6 = hid, ?7 = tags -> fid
pub const FILES_INSERT: &str = "INSERT INTO files (pid, name, filets, sidets, sidetags, hid, tags) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
     ON CONFLICT (pid, name) DO UPDATE SET \
       filets = excluded.filets, sidets = excluded.sidets, sidetags = excluded.sidetags, \
       hid = excluded.hid, tags = excluded.tags, enabled = 1 \
     RETURNING fid";
// update: ?1 = fid, ?2 = filets, ?3 = sidets, ?4 = sidetags, ?5 = hid, ?6 = tags
pub const FILES_UPDATE: &str = "UPDATE files SET filets = ?2, sidets = ?3, sidetags = ?4, hid = ?5, tags = ?6 WHERE fid = ?1";
// disable: ?1 = fid
pub const FILES_DISABLE: &str = "UPDATE files SET enabled = 0 WHERE fid = ?1";

// Merger.
// full: -> (fid, hid, tags)
pub const MERGE_FULL: &str = "SELECT fid, hid, tags FROM files WHERE enabled";
// poll: -> (fid, hid, tags, enabled); the five-minute window lives in the SQL.
pub const MERGE_POLL: &str = "SELECT fid, hid, tags, enabled FROM files \
     WHERE updated >= strftime('%s', 'now') - 300";
// select: -> (mid, hid, tags, blocked)
pub const MERGE_SELECT: &str = "SELECT mid, hid, tags, blocked FROM merged WHERE enabled";
// insert: ?1 = hid, ?2 = tags, ?3 = blocked -> mid
pub const MERGE_INSERT: &str = "INSERT INTO merged (hid, tags, blocked) VALUES (?1, ?2, ?3) \
     ON CONFLICT (hid) DO UPDATE SET \
       tags = excluded.tags, blocked = excluded.blocked, enabled = 1 \
     RETURNING mid";
// update: ?1 = tags, ?2 = blocked, ?3 = mid
pub const MERGE_UPDATE: &str = "UPDATE merged SET tags = ?1, blocked = ?2 WHERE mid = ?3";
// disable: ?1 = mid
pub const MERGE_DISABLE: &str = "UPDATE merged SET enabled = 0 WHERE mid = ?1";

// Weighter.
// full: -> (mid, hid, tags)
pub const WEIGHT_FULL: &str = "SELECT mid, hid, tags FROM merged WHERE enabled AND NOT blocked";
// poll: -> (mid, hid, tags, alive); blocked rows count as gone.
pub const WEIGHT_POLL: &str = "SELECT mid, hid, tags, (enabled AND NOT blocked) FROM merged \
     WHERE updated >= strftime('%s', 'now') - 300";

// Interners.
// ?1 = name -> tid
pub const TAG_GET_ID: &str = "INSERT INTO tags (name) VALUES (?1) \
     ON CONFLICT (name) DO UPDATE SET name = excluded.name RETURNING tid";
// ?1 = tid -> name
pub const TAG_GET_NAME: &str = "SELECT name FROM tags WHERE tid = ?1";
// ?1 = hash -> hid
pub const HASH_GET_ID: &str = "INSERT INTO hashes (hash) VALUES (?1) \
     ON CONFLICT (hash) DO UPDATE SET hash = excluded.hash RETURNING hid";
// ?1 = hid -> hash
pub const HASH_GET_HASH: &str = "SELECT hash FROM hashes WHERE hid = ?1";
