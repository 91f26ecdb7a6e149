// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Minimal CoAP URI parsing: just enough to populate `Uri-Host`/`Uri-Port`/`Uri-Path`/
//! `Uri-Query` options and to recognize the `coap`/`coaps`/`loop`/`null` schemes used to
//! select a [`Transport`](crate::transport::Transport). Full RFC 3986 URI semantics (percent
//! decoding edge cases, relative references, `userinfo`) are out of scope; see spec.md §1.

use crate::consts::{DEFAULT_PORT_COAP_DTLS, DEFAULT_PORT_COAP_UDP};
use crate::error::Error;

/// A parsed CoAP URI: scheme, host, port, path segments, and query segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    scheme: String,
    host: String,
    port: u16,
    path: Vec<String>,
    query: Vec<String>,
}

impl CoapUri {
    /// Parses a CoAP URI of the form `scheme://host[:port][/path...][?query...]`.
    pub fn parse(uri: &str) -> Result<CoapUri, Error> {
        let (scheme, rest) = uri.split_once("://").ok_or(Error::InvalidArgument)?;

        let (authority, path_and_query) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().map_err(|_| Error::InvalidArgument)?),
            None => (authority, default_port_for_scheme(scheme)),
        };

        if host.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let (path_str, query_str) = match path_and_query.find('?') {
            Some(i) => (&path_and_query[..i], &path_and_query[i + 1..]),
            None => (path_and_query, ""),
        };

        let path: Vec<String> = path_str
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let query: Vec<String> = if query_str.is_empty() {
            Vec::new()
        } else {
            query_str.split('&').map(String::from).collect()
        };

        Ok(CoapUri {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path,
            query,
        })
    }

    /// The URI scheme (`coap`, `coaps`, `loop`, `null`, ...).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host component.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, defaulted per-scheme if not explicit in the original URI text.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `Uri-Path` segments, in order, with no leading/trailing empty segments.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The `Uri-Query` segments, in order.
    pub fn query(&self) -> &[String] {
        &self.query
    }

    /// Returns a new `CoapUri` with the path replaced by the segments of `rel_path`
    /// (a `/`-separated relative reference such as `"hello"` or `"d1/d2"`).
    pub fn with_path(&self, rel_path: &str) -> CoapUri {
        let path = rel_path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        CoapUri {
            path,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for CoapUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if self.port != default_port_for_scheme(&self.scheme) {
            write!(f, ":{}", self.port)?;
        }
        for segment in &self.path {
            write!(f, "/{}", segment)?;
        }
        if !self.query.is_empty() {
            write!(f, "?{}", self.query.join("&"))?;
        }
        Ok(())
    }
}

fn default_port_for_scheme(scheme: &str) -> u16 {
    match scheme {
        "coaps" => DEFAULT_PORT_COAP_DTLS,
        _ => DEFAULT_PORT_COAP_UDP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_path_and_query() {
        let uri = CoapUri::parse("coap://coap.me/test?x=1").unwrap();
        assert_eq!(uri.scheme(), "coap");
        assert_eq!(uri.host(), "coap.me");
        assert_eq!(uri.port(), DEFAULT_PORT_COAP_UDP);
        assert_eq!(uri.path(), &["test".to_string()]);
        assert_eq!(uri.query(), &["x=1".to_string()]);
    }

    #[test]
    fn parses_explicit_port_and_nested_path() {
        let uri = CoapUri::parse("loop://localhost:9999/d1/d2/").unwrap();
        assert_eq!(uri.port(), 9999);
        assert_eq!(uri.path(), &["d1".to_string(), "d2".to_string()]);
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        assert_eq!(CoapUri::parse("not-a-uri"), Err(Error::InvalidArgument));
    }

    #[test]
    fn with_path_replaces_segments() {
        let uri = CoapUri::parse("loop://localhost/").unwrap();
        let moved = uri.with_path("hello");
        assert_eq!(moved.path(), &["hello".to_string()]);
        assert_eq!(moved.host(), "localhost");
    }
}
