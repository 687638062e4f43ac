//! Resource quota rejections
//!
//! The API server rejects a create that would push a namespace over its
//! `ResourceQuota` with a 403 whose message reads:
//!
//! ```text
//! exceeded quota: gpu-quota, requested: requests.nvidia.com/gpu=2, used: requests.nvidia.com/gpu=4, limited: requests.nvidia.com/gpu=5
//! ```
//!
//! A rejection whose request fits under the limit clears once other runs
//! release capacity and is retried. A request above the limit never fits.

use std::fmt;

/// Marker that identifies a quota rejection in an API error message
pub const QUOTA_MARKER: &str = "exceeded quota";

/// A parsed quota rejection for a single resource
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaExceeded {
    /// Name of the ResourceQuota object
    pub quota: String,
    /// Resource that overflowed (e.g., "requests.nvidia.com/gpu")
    pub resource: String,
    /// Amount the submission requested
    pub requested: f64,
    /// Amount already in use in the namespace
    pub used: f64,
    /// The quota's hard limit
    pub limited: f64,
}

impl QuotaExceeded {
    /// Whether the request could ever be admitted under this quota
    pub fn is_satisfiable(&self) -> bool {
        self.requested <= self.limited
    }

    /// Parse an API server rejection message.
    ///
    /// Returns `None` when the message is not a quota rejection. When several
    /// resources are listed, the first one that actually overflows is
    /// reported.
    pub fn parse(message: &str) -> Option<Self> {
        let start = message.find(QUOTA_MARKER)?;
        let body = &message[start + QUOTA_MARKER.len()..];
        let body = body.trim_start_matches(':').trim_start();

        let quota = body
            .split(',')
            .next()
            .map(str::trim)
            .filter(|q| !q.is_empty() && !q.contains(':'))
            .unwrap_or_default()
            .to_string();

        let requested = parse_pairs(section(body, "requested:", Some("used:"))?);
        let used = parse_pairs(section(body, "used:", Some("limited:")).unwrap_or_default());
        let limited = parse_pairs(section(body, "limited:", None)?);

        let lookup = |pairs: &[(String, f64)], resource: &str| {
            pairs
                .iter()
                .find(|(name, _)| name == resource)
                .map(|(_, q)| *q)
        };

        let candidates: Vec<QuotaExceeded> = requested
            .iter()
            .filter_map(|(resource, req)| {
                let limit = lookup(&limited, resource)?;
                Some(QuotaExceeded {
                    quota: quota.clone(),
                    resource: resource.clone(),
                    requested: *req,
                    used: lookup(&used, resource).unwrap_or(0.0),
                    limited: limit,
                })
            })
            .collect();

        let overflowing = candidates
            .iter()
            .position(|c| c.used + c.requested > c.limited)
            .unwrap_or(0);
        candidates.into_iter().nth(overflowing)
    }
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "quota {} exceeded for {}: requested {}, used {}, limited {}",
            self.quota, self.resource, self.requested, self.used, self.limited
        )
    }
}

/// Text between `key` and the next key (or the end of the message)
fn section<'a>(body: &'a str, key: &str, next: Option<&str>) -> Option<&'a str> {
    let start = body.find(key)? + key.len();
    let rest = &body[start..];
    let end = next.and_then(|n| rest.find(n)).unwrap_or(rest.len());
    Some(rest[..end].trim().trim_end_matches(',').trim())
}

/// Parse `name=quantity` pairs separated by commas, skipping anything malformed
fn parse_pairs(section: &str) -> Vec<(String, f64)> {
    section
        .split(',')
        .filter_map(|pair| {
            let (name, quantity) = pair.split_once('=')?;
            let quantity = parse_quantity(quantity.trim_end_matches('.'))?;
            Some((name.trim().to_string(), quantity))
        })
        .collect()
}

/// Parse a Kubernetes quantity (`500m`, `2`, `1Gi`, `1.5k`) into a plain number
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let number: f64 = number.parse().ok()?;

    let value = match suffix {
        "" => number,
        "n" => number / 1e9,
        "u" => number / 1e6,
        "m" => number / 1e3,
        "k" => number * 1e3,
        "M" => number * 1e6,
        "G" => number * 1e9,
        "T" => number * 1e12,
        "P" => number * 1e15,
        "E" => number * 1e18,
        "Ki" => number * 1024.0,
        "Mi" => number * 1024f64.powi(2),
        "Gi" => number * 1024f64.powi(3),
        "Ti" => number * 1024f64.powi(4),
        "Pi" => number * 1024f64.powi(5),
        "Ei" => number * 1024f64.powi(6),
        _ => return None,
    };
    Some(value)
}
