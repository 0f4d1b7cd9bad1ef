//! Broker discovery via `_mqtt._tcp` DNS-SRV records.
//!
//! Reimplements the connect-by-SRV helper the agents rely on: resolve the
//! service record for the local domain and try each target in priority
//! order. Record weight is not considered.

use std::io;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::debug;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

#[derive(Debug, Error)]
pub enum SrvError {
    #[error("could not determine local domain: {0}")]
    Hostname(#[source] io::Error),

    #[error("failed to build resolver from system config: {0}")]
    Resolver(#[source] hickory_resolver::error::ResolveError),

    #[error("No answer/NXDOMAIN for SRV in {domain}")]
    NoRecords { domain: String },

    #[error("No SRV hosts responded")]
    NoneReachable,
}

/// The DNS domain to search when none is given: the host's name minus its
/// first label, or the whole name if it has no dots.
pub fn local_domain() -> Result<String, SrvError> {
    let host = hostname::get().map_err(SrvError::Hostname)?;
    let host = host.to_string_lossy();
    Ok(domain_of(&host))
}

fn domain_of(host: &str) -> String {
    match host.find('.') {
        Some(idx) => host[idx + 1..].to_string(),
        None => host.to_string(),
    }
}

/// The service record name to resolve. IANA specifies `_secure-mqtt` (not
/// `mqtts`) for port 8883.
pub fn service_record_name(domain: &str, secure: bool) -> String {
    if secure {
        format!("_secure-mqtt._tcp.{}", domain)
    } else {
        format!("_mqtt._tcp.{}", domain)
    }
}

/// Targets sorted by record priority; weight is carried but unused.
pub fn order_targets(mut targets: Vec<SrvTarget>) -> Vec<SrvTarget> {
    targets.sort_by_key(|t| t.priority);
    targets
}

/// Resolve broker candidates for `domain` (the local domain when None).
pub async fn lookup(domain: Option<&str>, secure: bool) -> Result<Vec<SrvTarget>, SrvError> {
    let domain = match domain {
        Some(domain) => domain.to_string(),
        None => local_domain()?,
    };

    let record_name = service_record_name(&domain, secure);
    debug!("Resolving {}", record_name);

    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(SrvError::Resolver)?;
    let lookup = resolver
        .srv_lookup(record_name)
        .await
        .map_err(|_| SrvError::NoRecords {
            domain: domain.clone(),
        })?;

    let targets: Vec<SrvTarget> = lookup
        .iter()
        .map(|record| SrvTarget {
            host: record.target().to_utf8().trim_end_matches('.').to_string(),
            port: record.port(),
            priority: record.priority(),
            weight: record.weight(),
        })
        .collect();

    if targets.is_empty() {
        return Err(SrvError::NoRecords { domain });
    }

    Ok(order_targets(targets))
}

/// Probe targets in order and return the first that accepts a TCP
/// connection.
pub async fn first_reachable(targets: &[SrvTarget]) -> Result<(String, u16), SrvError> {
    for target in targets {
        let addr = (target.host.as_str(), target.port);
        let probe = tokio::time::timeout(
            CONNECT_PROBE_TIMEOUT,
            tokio::net::TcpStream::connect(addr),
        )
        .await;

        match probe {
            Ok(Ok(_)) => return Ok((target.host.clone(), target.port)),
            Ok(Err(e)) => debug!("{}:{} refused: {}", target.host, target.port, e),
            Err(_) => debug!("{}:{} timed out", target.host, target.port),
        }
    }

    Err(SrvError::NoneReachable)
}
