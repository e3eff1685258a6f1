use crate::error::{EngineError, IoContext, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "sha256" => Some(Algorithm::Sha256),
            "sha384" => Some(Algorithm::Sha384),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

/// Streaming hash over one of the supported algorithms.
pub enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(chunk),
            Hasher::Sha384(h) => h.update(chunk),
            Hasher::Sha512(h) => h.update(chunk),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// One `<alg>-<base64>` part of an SRI string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityDigest {
    pub algorithm: Algorithm,
    pub base64: String,
    raw: Vec<u8>,
}

impl IntegrityDigest {
    /// Lowercase hex of the decoded digest; names every CAS path.
    pub fn hex(&self) -> String {
        hex::encode(&self.raw)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn sri(&self) -> String {
        format!("{}-{}", self.algorithm.name(), self.base64)
    }
}

/// Parse a multi-hash SRI string, skipping empty and malformed parts.
/// Never errors; an unusable string parses to an empty list.
pub fn parse(integrity: &str) -> Vec<IntegrityDigest> {
    let mut out = Vec::new();
    for part in integrity.split_whitespace() {
        let Some((token, b64)) = part.split_once('-') else {
            continue;
        };
        let Some(algorithm) = Algorithm::from_token(token) else {
            continue;
        };
        let Ok(raw) = STANDARD.decode(b64) else {
            continue;
        };
        if raw.is_empty() {
            continue;
        }
        out.push(IntegrityDigest { algorithm, base64: b64.to_string(), raw });
    }
    out
}

/// sha512 is preferred when present, otherwise the first parsed digest.
pub fn preferred(digests: &[IntegrityDigest]) -> Option<&IntegrityDigest> {
    digests
        .iter()
        .find(|d| d.algorithm == Algorithm::Sha512)
        .or_else(|| digests.first())
}

#[derive(Debug, Clone)]
pub struct Verification {
    pub algorithm: Algorithm,
    pub actual_base64: String,
}

/// Stream a file and compare against the preferred digest, constant-time.
///
/// `required` controls whether an unparsable integrity is an error
/// (`IntegrityMissing`) or reported as `Ok(None)` for the caller to warn on.
pub fn verify_file(
    path: &Path,
    integrity: &str,
    required: bool,
    context: &str,
) -> Result<Option<Verification>> {
    let digests = parse(integrity);
    let Some(expected) = preferred(&digests) else {
        if required {
            return Err(EngineError::IntegrityMissing { context: context.to_string() });
        }
        return Ok(None);
    };
    let actual = hash_file(path, expected.algorithm)?;
    if !constant_time_eq(&actual, expected.raw()) {
        return Err(EngineError::IntegrityMismatch {
            context: context.to_string(),
            algorithm: expected.algorithm.name(),
            expected: expected.base64.clone(),
            actual: STANDARD.encode(&actual),
        });
    }
    Ok(Some(Verification {
        algorithm: expected.algorithm,
        actual_base64: STANDARD.encode(&actual),
    }))
}

pub fn hash_file(path: &Path, algorithm: Algorithm) -> Result<Vec<u8>> {
    let mut file = File::open(path).io_ctx(format!("open {}", path.display()))?;
    let mut hasher = algorithm.hasher();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk).io_ctx(format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hasher.finalize())
}

/// Length check first, then a full pass regardless of where bytes differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sri_for(content: &[u8], algorithm: Algorithm) -> String {
        let mut h = algorithm.hasher();
        h.update(content);
        format!("{}-{}", algorithm.name(), STANDARD.encode(h.finalize()))
    }

    #[test]
    fn parse_skips_malformed_parts() {
        let good = sri_for(b"abc", Algorithm::Sha256);
        let parsed = parse(&format!("  md5-zzzz {good} not-base64-!!!"));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].algorithm, Algorithm::Sha256);
    }

    #[test]
    fn parse_empty_string_is_empty() {
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn preferred_picks_sha512_over_first() {
        let s256 = sri_for(b"abc", Algorithm::Sha256);
        let s512 = sri_for(b"abc", Algorithm::Sha512);
        let digests = parse(&format!("{s256} {s512}"));
        assert_eq!(preferred(&digests).unwrap().algorithm, Algorithm::Sha512);

        let only256 = parse(&s256);
        assert_eq!(preferred(&only256).unwrap().algorithm, Algorithm::Sha256);
    }

    #[test]
    fn hex_matches_decoded_digest() {
        let s = sri_for(b"hello", Algorithm::Sha512);
        let d = &parse(&s)[0];
        assert_eq!(d.hex().len(), 128);
        assert_eq!(hex::decode(d.hex()).unwrap(), d.raw());
    }

    #[test]
    fn verify_file_accepts_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"payload bytes").unwrap();
        drop(f);

        let good = sri_for(b"payload bytes", Algorithm::Sha512);
        assert!(verify_file(&path, &good, true, "blob").unwrap().is_some());

        let bad = sri_for(b"different bytes", Algorithm::Sha512);
        let err = verify_file(&path, &bad, true, "blob").unwrap_err();
        assert!(matches!(err, EngineError::IntegrityMismatch { .. }));
    }

    #[test]
    fn missing_integrity_is_fatal_only_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"x").unwrap();

        let err = verify_file(&path, "", true, "blob").unwrap_err();
        assert!(matches!(err, EngineError::IntegrityMissing { .. }));
        assert!(verify_file(&path, "", false, "blob").unwrap().is_none());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
