//! Content hashing: exact SHA-256, perceptual image hashes, and fuzzy
//! content sketches. Every function here is deterministic for identical
//! bytes.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Chunk size for streamed SHA-256
const HASH_CHUNK_SIZE: usize = 8192;

/// Streamed SHA-256 of a file, hex-encoded lowercase.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 64-bit gradient (difference) hash of an image, hex-encoded.
///
/// The image is reduced to a 9x8 grayscale thumbnail; each bit records
/// whether a pixel is brighter than its right neighbour. Hamming distance
/// between two such hashes approximates visual similarity. Returns None
/// when the bytes do not decode as an image.
pub fn perceptual_hash(path: &Path) -> Option<String> {
    let img = image::open(path).ok()?;
    let gray = img.to_luma8();
    let thumb = image::imageops::resize(&gray, 9, 8, image::imageops::FilterType::Triangle);

    let mut bits: u64 = 0;
    for y in 0..8u32 {
        for x in 0..8u32 {
            bits <<= 1;
            if thumb.get_pixel(x, y)[0] > thumb.get_pixel(x + 1, y)[0] {
                bits |= 1;
            }
        }
    }
    Some(format!("{:016x}", bits))
}

/// Hamming distance between two hex-encoded 64-bit perceptual hashes.
pub fn hamming_distance(a: &str, b: &str) -> Result<u32> {
    let a = u64::from_str_radix(a, 16)
        .map_err(|e| Error::Hashing(format!("bad perceptual hash '{}': {}", a, e)))?;
    let b = u64::from_str_radix(b, 16)
        .map_err(|e| Error::Hashing(format!("bad perceptual hash '{}': {}", b, e)))?;
    Ok((a ^ b).count_ones())
}

/// Fuzzy (content-sketch) hash of a file. Returns None for unreadable or
/// empty files.
pub fn fuzzy_hash(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    if data.is_empty() {
        return None;
    }
    Some(fuzzyhash::FuzzyHash::new(&data).to_string())
}

/// Similarity of two fuzzy hashes on a 0..100 scale. Incomparable hashes
/// score 0.
pub fn fuzzy_similarity(a: &str, b: &str) -> u32 {
    fuzzyhash::FuzzyHash::compare(a, b).unwrap_or(0)
}

/// Best-effort MIME type from a file name, used when upstream did not
/// declare one.
pub fn mime_from_name(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "gz" => "application/gzip",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn write_png(dir: &Path, name: &str, tweak: bool) -> std::path::PathBuf {
        let img = ImageBuffer::from_fn(128, 128, |x, y| {
            // A gradient with one antialiased pixel flipped in the tweaked copy
            let mut v = ((x + y) % 256) as u8;
            if tweak && x == 64 && y == 64 {
                v = v.wrapping_add(9);
            }
            Luma([v])
        });
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_sha256_streaming_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_deterministic_for_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, vec![7u8; 100_000]).unwrap();
        std::fs::write(&b, vec![7u8; 100_000]).unwrap();
        assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());
    }

    #[test]
    fn test_perceptual_hash_identical_images_match() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", false);
        let b = write_png(dir.path(), "b.png", false);
        let ha = perceptual_hash(&a).unwrap();
        let hb = perceptual_hash(&b).unwrap();
        assert_eq!(hamming_distance(&ha, &hb).unwrap(), 0);
    }

    #[test]
    fn test_perceptual_hash_near_duplicate_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", false);
        let b = write_png(dir.path(), "b.png", true);
        let ha = perceptual_hash(&a).unwrap();
        let hb = perceptual_hash(&b).unwrap();
        assert!(hamming_distance(&ha, &hb).unwrap() <= 5);
    }

    #[test]
    fn test_perceptual_hash_rejects_non_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-image.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(perceptual_hash(&path).is_none());
    }

    #[test]
    fn test_hamming_distance_counts_bits() {
        assert_eq!(hamming_distance("0000000000000000", "0000000000000000").unwrap(), 0);
        assert_eq!(hamming_distance("0000000000000000", "000000000000000f").unwrap(), 4);
        assert!(hamming_distance("zzzz", "0").is_err());
    }

    #[test]
    fn test_fuzzy_hash_identical_content_scores_100() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        let body: String = (0..200).map(|i| format!("line {} of sample content\n", i)).collect();
        std::fs::write(&path, &body).unwrap();

        let hash = fuzzy_hash(&path).unwrap();
        assert_eq!(fuzzy_similarity(&hash, &hash), 100);
    }

    #[test]
    fn test_fuzzy_hash_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert!(fuzzy_hash(&path).is_none());
    }

    #[test]
    fn test_mime_from_name() {
        assert_eq!(mime_from_name("photo.JPG"), Some("image/jpeg"));
        assert_eq!(mime_from_name("archive.tar.gz"), Some("application/gzip"));
        assert_eq!(mime_from_name("no-extension"), None);
    }
}
