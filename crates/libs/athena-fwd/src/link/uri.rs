use crate::error::{AthenaError, Result};

/// Parsed link URI: `scheme://authority("/"option)*`. Option order is
/// free; unknown options are rejected rather than ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUri {
    pub scheme: String,
    pub authority: String,
    pub listener: bool,
    pub name: Option<String>,
    pub local: Option<bool>,
    pub mtu: Option<usize>,
    pub fragmenter: Option<String>,
    pub src: Option<String>,
}

impl LinkUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| AthenaError::Invalid(format!("link uri missing scheme: {}", uri)))?;
        if scheme.is_empty() {
            return Err(AthenaError::Invalid(format!("link uri missing scheme: {}", uri)));
        }

        let mut parts = rest.split('/');
        let authority = parts
            .next()
            .filter(|authority| !authority.is_empty())
            .ok_or_else(|| AthenaError::Invalid(format!("link uri missing authority: {}", uri)))?;

        let mut parsed = LinkUri {
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            listener: false,
            name: None,
            local: None,
            mtu: None,
            fragmenter: None,
            src: None,
        };

        for option in parts {
            if option.is_empty() {
                continue;
            }
            match option.split_once('=') {
                None if option.eq_ignore_ascii_case("listener") => parsed.listener = true,
                Some((key, value)) if key.eq_ignore_ascii_case("name") => {
                    parsed.name = Some(value.to_string());
                }
                Some((key, value)) if key.eq_ignore_ascii_case("local") => {
                    parsed.local = Some(match value {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(AthenaError::Invalid(format!(
                                "bad local option value: {}",
                                value
                            )))
                        }
                    });
                }
                Some((key, value)) if key.eq_ignore_ascii_case("mtu") => {
                    let mtu = value
                        .parse()
                        .map_err(|_| AthenaError::Invalid(format!("bad mtu value: {}", value)))?;
                    parsed.mtu = Some(mtu);
                }
                Some((key, value)) if key.eq_ignore_ascii_case("fragmenter") => {
                    parsed.fragmenter = Some(value.to_string());
                }
                Some((key, value)) if key.eq_ignore_ascii_case("src") => {
                    parsed.src = Some(value.to_string());
                }
                _ => {
                    return Err(AthenaError::Invalid(format!("unknown link option: {}", option)));
                }
            }
        }

        Ok(parsed)
    }
}
