//! SASL mechanism registry and selection.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::scram::ChannelBindingMode;
use crate::config::ChannelBinding;
use crate::error::{PgError, PgResult};

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// A SASL mechanism the client can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mechanism {
    pub name: &'static str,
    /// Whether the mechanism binds to the TLS channel.
    pub channel_binding: bool,
    /// Rank when the caller expresses no preference; lower wins.
    pub default_rank: u8,
}

static REGISTRY: Lazy<HashMap<&'static str, Mechanism>> = Lazy::new(|| {
    [
        Mechanism {
            name: SCRAM_SHA_256_PLUS,
            channel_binding: true,
            default_rank: 0,
        },
        Mechanism {
            name: SCRAM_SHA_256,
            channel_binding: false,
            default_rank: 1,
        },
    ]
    .into_iter()
    .map(|m| (m.name, m))
    .collect()
});

pub fn lookup(name: &str) -> Option<&'static Mechanism> {
    REGISTRY.get(name)
}

pub fn is_supported(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

/// Mechanism names in default preference order.
pub fn supported() -> Vec<&'static str> {
    let mut all: Vec<&Mechanism> = REGISTRY.values().collect();
    all.sort_by_key(|m| m.default_rank);
    all.into_iter().map(|m| m.name).collect()
}

/// Pick a mechanism from those the server offered.
///
/// `preferred` restricts and orders the candidates; empty means every
/// registered mechanism in default order. `tls_binding` is the channel binding
/// data of the live TLS session, absent on plain connections.
pub fn select(
    offered: &[String],
    preferred: &[String],
    policy: ChannelBinding,
    tls_binding: Option<&[u8]>,
) -> PgResult<(&'static Mechanism, ChannelBindingMode)> {
    let candidates: Vec<&'static Mechanism> = if preferred.is_empty() {
        supported().into_iter().filter_map(lookup).collect()
    } else {
        preferred.iter().filter_map(|name| lookup(name)).collect()
    };

    let server_offers_plus = offered.iter().any(|m| m == SCRAM_SHA_256_PLUS);

    for mechanism in candidates {
        if !offered.iter().any(|m| m == mechanism.name) {
            continue;
        }

        if mechanism.channel_binding {
            match (policy, tls_binding) {
                (ChannelBinding::Disable, _) | (_, None) => continue,
                (_, Some(data)) => {
                    return Ok((
                        mechanism,
                        ChannelBindingMode::TlsServerEndPoint(data.to_vec()),
                    ))
                }
            }
        }

        if policy == ChannelBinding::Require {
            continue;
        }

        let mode = if tls_binding.is_some()
            && policy != ChannelBinding::Disable
            && !server_offers_plus
        {
            ChannelBindingMode::NotOffered
        } else {
            ChannelBindingMode::Unsupported
        };
        return Ok((mechanism, mode));
    }

    if policy == ChannelBinding::Require {
        return Err(PgError::Auth(format!(
            "channel binding required but not available (server offered {:?}, TLS {})",
            offered,
            if tls_binding.is_some() { "on" } else { "off" }
        )));
    }

    Err(PgError::Auth(format!(
        "none of the SASL mechanisms offered by the server are supported: {:?}",
        offered
    )))
}
