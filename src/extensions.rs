//! `Sec-WebSocket-Extensions` declarations and per-frame extension hooks.
//!
//! The crate does not ship an extension algorithm; it negotiates the header
//! grammar and gives installed [`Extension`] implementations a chance to
//! rewrite frames on both paths. A declaration looks like
//! `permessage-deflate; client_max_window_bits=15` and several of them may
//! share one header, comma separated.

use std::sync::Arc;

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::space0,
    combinator::opt,
    sequence::{pair, preceded},
    IResult, Parser,
};

use crate::frame::Frame;
use crate::Result;

/// One negotiated or offered extension declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDecl {
    pub name: String,
    /// Parameters in declaration order; a parameter may be valueless.
    pub params: Vec<(String, Option<String>)>,
}

impl ExtensionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.params.push((key.into(), value));
        self
    }

    /// Parses a whole header value, which may list several declarations.
    pub fn parse_list(input: &str) -> std::result::Result<Vec<Self>, String> {
        input
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse())
            .collect()
    }

    fn parse(input: &str) -> std::result::Result<Self, nom::Err<nom::error::Error<&str>>> {
        let (mut input, name) = extension_name(input)?;
        let mut this = Self::new(name);
        while !input.is_empty() {
            let (remaining, (key, value)) = extension_param(input)?;
            this.params.push((key.to_string(), value.map(str::to_string)));
            input = remaining;
        }
        Ok(this)
    }
}

fn token(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn extension_name(input: &str) -> IResult<&str, &str> {
    preceded(space0, take_while1(token)).parse(input)
}

// ; client_max_window_bits=15
fn extension_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        space0,
        preceded(
            tag(";"),
            preceded(
                space0,
                pair(take_while1(token), opt(preceded(tag("="), take_while1(token)))),
            ),
        ),
    )
    .parse(input)
}

impl std::fmt::Display for ExtensionDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.params {
            match value {
                Some(value) => write!(f, "; {key}={value}")?,
                None => write!(f, "; {key}")?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ExtensionDecl {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(input).map_err(|err| err.to_string())
    }
}

/// Serializes a list of declarations back into a header value.
pub fn format_list(decls: &[ExtensionDecl]) -> String {
    decls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks a server's accepted declarations against the client's offers.
///
/// Every accepted extension must have been offered by name; the server's
/// parameter choices are taken as-is. Returns the accepted declarations in
/// server order, or the name of the uninvited extension.
pub fn match_response(
    offered: &[ExtensionDecl],
    accepted: &[ExtensionDecl],
) -> std::result::Result<Vec<ExtensionDecl>, String> {
    for decl in accepted {
        if !offered.iter().any(|offer| offer.name == decl.name) {
            return Err(decl.name.clone());
        }
    }
    Ok(accepted.to_vec())
}

/// Builds a fresh per-connection [`Extension`] instance from the
/// declaration the server accepted, parameter choices included.
pub type ExtensionFactory = Arc<dyn Fn(&ExtensionDecl) -> Box<dyn Extension> + Send + Sync>;

/// An offered extension: the declaration advertised to the server and the
/// factory that backs it once the server agrees. Pairing the two means an
/// offer cannot be sent without an implementation to honor it.
#[derive(Clone)]
pub struct ExtensionOffer {
    pub decl: ExtensionDecl,
    pub factory: ExtensionFactory,
}

impl ExtensionOffer {
    pub fn new(decl: ExtensionDecl, factory: ExtensionFactory) -> Self {
        Self { decl, factory }
    }
}

/// Per-frame hook for a negotiated extension.
///
/// Implementations may rewrite payloads (and the RSV1 bit) on either path.
/// The default passes frames through untouched.
pub trait Extension: Send {
    /// Name matched against the negotiated declarations.
    fn name(&self) -> &str;

    /// Whether the extension uses the RSV1 bit, making it legal on
    /// incoming frames.
    fn claims_rsv1(&self) -> bool {
        false
    }

    fn process_incoming(&mut self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }

    fn process_outgoing(&mut self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_only() {
        let decl: ExtensionDecl = "permessage-deflate".parse().unwrap();
        assert_eq!(decl.name, "permessage-deflate");
        assert!(decl.params.is_empty());
    }

    #[test]
    fn parses_params_with_and_without_values() {
        let decl: ExtensionDecl =
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=12"
                .parse()
                .unwrap();
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.params[0], ("client_no_context_takeover".to_string(), None));
        assert_eq!(
            decl.params[1],
            ("server_max_window_bits".to_string(), Some("12".to_string()))
        );
    }

    #[test]
    fn parses_comma_separated_list() {
        let decls = ExtensionDecl::parse_list("foo; a=1, bar, baz; flag").unwrap();
        assert_eq!(decls.len(), 3);
        assert_eq!(decls[0].name, "foo");
        assert_eq!(decls[1].name, "bar");
        assert_eq!(decls[2].params, vec![("flag".to_string(), None)]);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ExtensionDecl>().is_err());
        assert!("foo; bar=".parse::<ExtensionDecl>().is_err());
        assert!("foo; =1".parse::<ExtensionDecl>().is_err());
    }

    #[test]
    fn display_roundtrip() {
        let input = "permessage-deflate; server_no_context_takeover; client_max_window_bits=15";
        let decl: ExtensionDecl = input.parse().unwrap();
        assert_eq!(decl.to_string(), input);
    }

    #[test]
    fn response_must_be_subset_of_offers() {
        let offered = vec![
            ExtensionDecl::new("permessage-deflate"),
            ExtensionDecl::new("x-custom"),
        ];
        let accepted =
            vec![ExtensionDecl::new("permessage-deflate").with_param("server_no_context_takeover", None)];
        let agreed = match_response(&offered, &accepted).unwrap();
        assert_eq!(agreed.len(), 1);
        assert_eq!(agreed[0].params.len(), 1);

        let uninvited = vec![ExtensionDecl::new("x-other")];
        assert_eq!(match_response(&offered, &uninvited).unwrap_err(), "x-other");
    }
}
