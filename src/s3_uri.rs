//! Object URIs, per-object client authorization and compression selection.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::{Position, Url};

use crate::error::{ClusterError, Result};

const AWS_DOMAIN: &str = ".amazonaws.com";

/// A parsed object-storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Uri {
    /// `scheme://host[:port]` for non-AWS endpoints; empty for `s3://` and
    /// AWS hosts, whose endpoint is derived from the region.
    pub endpoint: String,
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    pub is_virtual_hosted: bool,
}

impl S3Uri {
    /// Parse `s3://bucket/key`, virtual-hosted
    /// `https://bucket.s3[.region].amazonaws.com/key`, path-style
    /// `https://s3[.region].amazonaws.com/bucket/key` or a custom endpoint
    /// `http(s)://host[:port]/bucket/key`. Path segments are percent-decoded;
    /// the query and fragment of http(s) URIs are ignored.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| ClusterError::Arguments(format!("invalid object URI '{uri}': {reason}"));

        let (scheme, _) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        // `?` in an s3:// key is a glob wildcard, not the start of a query.
        let source = if scheme.eq_ignore_ascii_case("s3") {
            uri.replace('?', "%3F")
        } else {
            uri.to_string()
        };
        let url = Url::parse(&source).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().unwrap_or_default();
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let segments = decoded_segments(&url).map_err(|e| invalid(&e))?;

        let parsed = match url.scheme() {
            "s3" => S3Uri {
                endpoint: String::new(),
                bucket: host.to_string(),
                key: segments.join("/"),
                region: None,
                is_virtual_hosted: false,
            },
            "http" | "https" => match host.to_lowercase().strip_suffix(AWS_DOMAIN) {
                Some(prefix) => Self::parse_aws(prefix, segments).ok_or_else(|| invalid("unrecognised AWS host"))?,
                None => {
                    let (bucket, key) = split_bucket(segments);
                    S3Uri {
                        endpoint: url[..Position::BeforePath].to_string(),
                        bucket,
                        key,
                        region: None,
                        is_virtual_hosted: false,
                    }
                }
            },
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };

        if parsed.bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        Ok(parsed)
    }

    fn parse_aws(prefix: &str, segments: Vec<String>) -> Option<Self> {
        // Path style: s3.amazonaws.com, s3.<region>.amazonaws.com, s3-<region>.amazonaws.com
        if prefix == "s3" || prefix.starts_with("s3.") || prefix.starts_with("s3-") {
            let region = prefix
                .get(3..)
                .filter(|r| !r.is_empty())
                .map(|r| r.to_string());
            let (bucket, key) = split_bucket(segments);
            return Some(S3Uri {
                endpoint: String::new(),
                bucket,
                key,
                region,
                is_virtual_hosted: false,
            });
        }

        // Virtual hosted: <bucket>.s3[.<region>].amazonaws.com
        let (bucket, service) = match prefix.rfind(".s3") {
            Some(pos) => (&prefix[..pos], &prefix[pos + 1..]),
            None => return None,
        };
        let region = service
            .strip_prefix("s3")
            .and_then(|r| r.strip_prefix('.').or_else(|| r.strip_prefix('-')))
            .filter(|r| !r.is_empty())
            .map(|r| r.to_string());
        Some(S3Uri {
            endpoint: String::new(),
            bucket: bucket.to_string(),
            key: segments.join("/"),
            region,
            is_virtual_hosted: true,
        })
    }

    /// `bucket/key`, the value of the `_path` virtual column.
    pub fn path(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Last segment of the key, the value of the `_file` virtual column.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for S3Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

fn decoded_segments(url: &Url) -> std::result::Result<Vec<String>, String> {
    let Some(segments) = url.path_segments() else {
        return Ok(Vec::new());
    };
    segments
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .map_err(|e| format!("path is not UTF-8: {e}"))
        })
        .collect()
}

fn split_bucket(mut segments: Vec<String>) -> (String, String) {
    if segments.is_empty() {
        return (String::new(), String::new());
    }
    let bucket = segments.remove(0);
    (bucket, segments.join("/"))
}

/// Credentials shared by every object a query touches.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub max_connections: u64,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("access_key_id", &self.access_key_id)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Authorization for one object client: the query's credentials bound to the
/// object's location. Built fresh for every key since region and endpoint
/// may differ from key to key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    pub uri: S3Uri,
    pub auth: AuthContext,
}

impl ClientAuth {
    pub fn new(auth: &AuthContext, uri: S3Uri) -> Self {
        Self {
            uri,
            auth: auth.clone(),
        }
    }

    pub fn for_key(auth: &AuthContext, key: &str) -> Result<Self> {
        Ok(Self::new(auth, S3Uri::parse(key)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Gzip,
    Brotli,
    Xz,
    Zstd,
    Bzip2,
    Lz4,
}

impl CompressionMethod {
    /// Resolve the compression of `key`. `auto` (or an empty hint) picks by
    /// file extension; anything else names the method explicitly.
    pub fn choose(key: &str, hint: &str) -> Result<Self> {
        let hint = hint.trim().to_lowercase();
        if hint.is_empty() || hint == "auto" {
            return Ok(Self::from_extension(key));
        }
        match hint.as_str() {
            "none" => Ok(Self::None),
            "gzip" | "gz" | "deflate" => Ok(Self::Gzip),
            "br" | "brotli" => Ok(Self::Brotli),
            "xz" | "lzma" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            "bz2" | "bzip2" => Ok(Self::Bzip2),
            "lz4" => Ok(Self::Lz4),
            other => Err(ClusterError::Arguments(format!(
                "unknown compression method '{other}'"
            ))),
        }
    }

    fn from_extension(key: &str) -> Self {
        match key.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()).as_deref() {
            Some("gz") => Self::Gzip,
            Some("br") => Self::Brotli,
            Some("xz") => Self::Xz,
            Some("zst") => Self::Zstd,
            Some("bz2") => Self::Bzip2,
            Some("lz4") => Self::Lz4,
            _ => Self::None,
        }
    }
}
