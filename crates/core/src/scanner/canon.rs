//! Content hashing and the content-addressed image cache.

use super::conf::HashKind;
use crate::error::{Error, Result};
use crate::imaging::{self, CacheFormat};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Streams a file through the configured hash; lowercase hex digest.
pub(crate) fn hash_file(kind: HashKind, path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = kind.hasher();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Cache location for a hash: `<root>/<h[0]>/<h[1]>/<hash>.<ext>`. The
/// two leading characters form a 256-way shard.
pub(crate) fn cache_path(root: &Path, hash: &str, format: CacheFormat) -> PathBuf {
    root.join(&hash[0..1])
        .join(&hash[1..2])
        .join(format!("{hash}.{}", format.ext()))
}

/// Decodes, orients, shrinks and writes the canonical cache entry for a
/// source image, unless it already exists. The write goes to a `.tmp`
/// sibling first and renames into place, so a visible cache file always
/// decodes.
pub(crate) fn cache_image(
    src: &Path,
    hash: &str,
    root: &Path,
    max_resolution: (u32, u32),
    format: CacheFormat,
) -> Result<()> {
    if hash.len() < 3 {
        return Err(Error::Invariant(format!("bad hash {hash:?}")));
    }
    let target = cache_path(root, hash, format);
    if target.exists() {
        debug!(hash, "cache entry exists");
        return Ok(());
    }

    let shard = target.parent().expect("cache path has a parent");
    make_shard_dir(shard)?;

    let bytes = std::fs::read(src)?;
    let mut img = imaging::decode_oriented(&bytes)?;

    let old = (img.width(), img.height());
    let new = imaging::shrink_to_fit(old, max_resolution);
    if new != old {
        info!(src = %src.display(), ?old, ?new, "resizing");
        img = imaging::resize(&img, new);
    }

    let encoded = imaging::encode(&img, format)?;
    let tmp = PathBuf::from(format!("{}.tmp", target.display()));
    {
        let mut out = std::fs::File::create(&tmp)?;
        out.write_all(&encoded)?;
        out.sync_all()?;
    }
    std::fs::rename(&tmp, &target)?;
    info!(hash, target = %target.display(), "cached");
    Ok(())
}

#[cfg(unix)]
fn make_shard_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
}

#[cfg(not(unix))]
fn make_shard_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    #[test]
    fn hash_file_is_stable_hex() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.bin");
        std::fs::write(&file, b"hello world").unwrap();
        let sha256 = hash_file(HashKind::Sha256, &file).unwrap();
        assert_eq!(
            sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let sha1 = hash_file(HashKind::Sha1, &file).unwrap();
        assert_eq!(sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn cache_image_writes_sharded_decodable_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("img.png");
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            900,
            800,
            image::Rgba([10, 20, 30, 255]),
        ));
        std::fs::write(&src, imaging::encode(&img, CacheFormat::Png).unwrap()).unwrap();

        let root = dir.path().join("cache");
        let hash = hash_file(HashKind::Sha256, &src).unwrap();
        cache_image(&src, &hash, &root, (800, 800), CacheFormat::Png).unwrap();

        let target = cache_path(&root, &hash, CacheFormat::Png);
        assert!(target.exists());
        assert_eq!(target.parent().unwrap().parent().unwrap().parent().unwrap(), root);
        let cached = imaging::decode_oriented(&std::fs::read(&target).unwrap()).unwrap();
        assert_eq!((cached.width(), cached.height()), (800, 711));

        // Second call is a no-op on the existing entry.
        cache_image(&src, &hash, &root, (800, 800), CacheFormat::Png).unwrap();
        // No stray .tmp left behind.
        let shard = target.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(shard)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
