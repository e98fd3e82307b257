//! Ingress annotation parsing
//!
//! Turns the `alb.ingress.kubernetes.io/*` annotations of an Ingress into a
//! validated [`Annotations`] value. [`AnnotationResolver`] remembers annotation
//! sets that failed validation so the same broken set is not re-validated and
//! re-reported on every tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::aws::{HealthCheck, IpAddressType, Protocol, Scheme, Tags};
use crate::error::{Error, Result};

/// Prefix shared by every annotation this controller reads
pub const ANNOTATION_PREFIX: &str = "alb.ingress.kubernetes.io/";

pub const SCHEME: &str = "alb.ingress.kubernetes.io/scheme";
pub const SUBNETS: &str = "alb.ingress.kubernetes.io/subnets";
pub const SECURITY_GROUPS: &str = "alb.ingress.kubernetes.io/security-groups";
pub const IP_ADDRESS_TYPE: &str = "alb.ingress.kubernetes.io/ip-address-type";
pub const TAGS: &str = "alb.ingress.kubernetes.io/tags";
pub const LISTEN_PORTS: &str = "alb.ingress.kubernetes.io/listen-ports";
pub const CERTIFICATE_ARN: &str = "alb.ingress.kubernetes.io/certificate-arn";
pub const BACKEND_PROTOCOL: &str = "alb.ingress.kubernetes.io/backend-protocol";
pub const HEALTHCHECK_PATH: &str = "alb.ingress.kubernetes.io/healthcheck-path";
pub const HEALTHCHECK_INTERVAL: &str = "alb.ingress.kubernetes.io/healthcheck-interval-seconds";
pub const SUCCESS_CODES: &str = "alb.ingress.kubernetes.io/success-codes";

/// How long a failed annotation set is remembered
pub const DEFAULT_INVALID_TTL: Duration = Duration::from_secs(3600);

const MIN_HEALTHCHECK_INTERVAL: i32 = 5;
const MAX_HEALTHCHECK_INTERVAL: i32 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenPort {
    pub port: i32,
    pub protocol: Protocol,
}

/// Validated load balancer configuration for one Ingress
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub ip_address_type: IpAddressType,
    /// Caller-supplied tags applied to every resource
    pub tags: Tags,
    pub listen_ports: Vec<ListenPort>,
    pub certificate_arn: Option<String>,
    pub backend_protocol: Protocol,
    pub health_check: HealthCheck,
}

impl Annotations {
    pub fn parse(raw: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| raw.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let subnets = get(SUBNETS).map(split_list).unwrap_or_default();
        if subnets.len() < 2 {
            return Err(Error::AnnotationError(format!(
                "{SUBNETS} must list at least two subnets in different availability zones"
            )));
        }

        let scheme = get(SCHEME)
            .map(str::parse::<Scheme>)
            .transpose()?
            .unwrap_or_default();
        let ip_address_type = get(IP_ADDRESS_TYPE)
            .map(str::parse::<IpAddressType>)
            .transpose()?
            .unwrap_or_default();
        let backend_protocol = get(BACKEND_PROTOCOL)
            .map(str::parse::<Protocol>)
            .transpose()?
            .unwrap_or_default();

        let certificate_arn = get(CERTIFICATE_ARN).map(str::to_string);
        let listen_ports = match get(LISTEN_PORTS) {
            Some(value) => parse_listen_ports(value)?,
            None if certificate_arn.is_some() => vec![ListenPort {
                port: 443,
                protocol: Protocol::Https,
            }],
            None => vec![ListenPort {
                port: 80,
                protocol: Protocol::Http,
            }],
        };
        if certificate_arn.is_none() && listen_ports.iter().any(|p| p.protocol == Protocol::Https)
        {
            return Err(Error::AnnotationError(format!(
                "HTTPS listeners require {CERTIFICATE_ARN}"
            )));
        }

        Ok(Self {
            scheme,
            subnets,
            security_groups: get(SECURITY_GROUPS).map(split_list).unwrap_or_default(),
            ip_address_type,
            tags: get(TAGS).map(parse_tags).transpose()?.unwrap_or_default(),
            listen_ports,
            certificate_arn,
            backend_protocol,
            health_check: parse_health_check(&get)?,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_tags(value: &str) -> Result<Tags> {
    let mut tags = Tags::new();
    for pair in split_list(value) {
        let (key, val) = pair.split_once('=').ok_or_else(|| {
            Error::AnnotationError(format!("{TAGS} entry {pair:?} is not in key=value form"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::AnnotationError(format!(
                "{TAGS} entry {pair:?} has an empty key"
            )));
        }
        // Later entries override earlier ones with the same key
        tags.set(key, val.trim());
    }
    Ok(tags)
}

/// Parses `[{"HTTP": 80}, {"HTTPS": 443}]`
fn parse_listen_ports(value: &str) -> Result<Vec<ListenPort>> {
    let entries: Vec<BTreeMap<String, i32>> = serde_json::from_str(value)
        .map_err(|e| Error::AnnotationError(format!("{LISTEN_PORTS} is not valid JSON: {e}")))?;

    let mut ports: Vec<ListenPort> = Vec::new();
    for entry in entries {
        for (protocol, port) in entry {
            if !(1..=65535).contains(&port) {
                return Err(Error::AnnotationError(format!(
                    "{LISTEN_PORTS} port {port} is out of range"
                )));
            }
            if ports.iter().any(|p| p.port == port) {
                return Err(Error::AnnotationError(format!(
                    "{LISTEN_PORTS} lists port {port} more than once"
                )));
            }
            ports.push(ListenPort {
                port,
                protocol: protocol.parse()?,
            });
        }
    }
    if ports.is_empty() {
        return Err(Error::AnnotationError(format!(
            "{LISTEN_PORTS} must contain at least one port"
        )));
    }
    Ok(ports)
}

fn parse_health_check<'a>(get: &impl Fn(&str) -> Option<&'a str>) -> Result<HealthCheck> {
    let mut health_check = HealthCheck::default();

    if let Some(path) = get(HEALTHCHECK_PATH) {
        if !path.starts_with('/') {
            return Err(Error::AnnotationError(format!(
                "{HEALTHCHECK_PATH} must start with '/', got {path:?}"
            )));
        }
        health_check.path = path.to_string();
    }

    if let Some(interval) = get(HEALTHCHECK_INTERVAL) {
        let seconds: i32 = interval.parse().map_err(|_| {
            Error::AnnotationError(format!("{HEALTHCHECK_INTERVAL} must be an integer"))
        })?;
        if !(MIN_HEALTHCHECK_INTERVAL..=MAX_HEALTHCHECK_INTERVAL).contains(&seconds) {
            return Err(Error::AnnotationError(format!(
                "{HEALTHCHECK_INTERVAL} must be between {MIN_HEALTHCHECK_INTERVAL} and {MAX_HEALTHCHECK_INTERVAL}"
            )));
        }
        health_check.interval_seconds = seconds;
    }

    if let Some(codes) = get(SUCCESS_CODES) {
        health_check.success_codes = codes.to_string();
    }

    Ok(health_check)
}

/// Outcome of resolving an annotation set that did not fail outright
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Resolved(Annotations),
    /// This exact set already failed validation recently; the detailed
    /// error was reported then
    KnownInvalid,
}

/// Annotation parser with a memory of recently rejected annotation sets
pub struct AnnotationResolver {
    ttl: Duration,
    invalid: Mutex<HashMap<String, Instant>>,
}

impl Default for AnnotationResolver {
    fn default() -> Self {
        Self::new(DEFAULT_INVALID_TTL)
    }
}

impl AnnotationResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            invalid: Mutex::new(HashMap::new()),
        }
    }

    fn invalid(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.invalid.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Parse `raw`, or report it as known-invalid if it failed within the TTL.
    ///
    /// A parse failure is returned as `Err` once and remembered; later calls
    /// with the same set return `Ok(Resolution::KnownInvalid)` until the entry
    /// expires.
    pub fn resolve(&self, raw: &BTreeMap<String, String>) -> Result<Resolution> {
        let key = fingerprint(raw);
        let now = Instant::now();

        {
            let mut invalid = self.invalid();
            invalid.retain(|_, seen| now.duration_since(*seen) < self.ttl);
            if invalid.contains_key(&key) {
                debug!(fingerprint = %key, "Annotation set previously failed validation");
                return Ok(Resolution::KnownInvalid);
            }
        }

        match Annotations::parse(raw) {
            Ok(annotations) => Ok(Resolution::Resolved(annotations)),
            Err(e) => {
                self.invalid().insert(key, now);
                Err(e)
            }
        }
    }

    /// Forget every remembered failure
    pub fn clear(&self) {
        self.invalid().clear();
    }
}

/// SHA-256 over the controller's annotations in key order
pub fn fingerprint(raw: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in raw.iter().filter(|(k, _)| k.starts_with(ANNOTATION_PREFIX)) {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
