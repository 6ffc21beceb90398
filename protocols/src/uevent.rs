// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Kernel uevent datagrams and declarative uevent filters.
//!
//! A uevent arrives over the netlink socket as NUL-separated `KEY=VALUE`
//! tokens behind a summary token. Which uevents the service reacts to is
//! not hardcoded; the configuration describes each kind of interest as a
//! set of `ATTR=REGEX` pairs and a uevent is recognized when every pair
//! finds its attribute with a matching value.

use {
    super::*,
    regex::Regex,
    tracing::{trace, warn},
};

/// A parsed uevent datagram.
#[derive(Debug)]
pub struct Uevent {
    summary: String,
    pairs: Vec<(String, String)>,
}

impl Uevent {
    /// Split a datagram into the summary and the attribute pairs. A token
    /// without `=` is kept as an attribute with an empty value.
    pub fn parse(data: &[u8]) -> Option<Uevent> {
        let mut tokens = data
            .split(|&b| b == 0)
            .filter(|t| !t.is_empty())
            .map(|t| String::from_utf8_lossy(t).into_owned());

        let summary = tokens.next()?;
        let pairs = tokens
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token, String::new()),
            })
            .collect();

        Some(Uevent { summary, pairs })
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A named set of `ATTR=REGEX` pairs with a match counter. The filter is
/// reset before each uevent, fed every attribute of it, then asked whether
/// all of its pairs were satisfied.
#[derive(Debug)]
pub struct UeventFilter {
    name: String,
    pairs: Vec<(String, Regex)>,
    matches: usize,
}

impl UeventFilter {
    /// Build a filter from the whitespace-separated `ATTR=REGEX` tokens of
    /// a configuration value. A token with an unparseable regex is dropped
    /// with a warning; a filter without any valid pair is refused.
    pub fn parse(name: &str, expr: &str) -> Result<UeventFilter> {
        let mut pairs = Vec::new();

        for token in expr.split_whitespace() {
            let (attr, rex) = match token.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };

            // the configured pattern must match the whole attribute value
            match Regex::new(&format!("^(?:{})$", rex)) {
                Ok(rex) => {
                    trace!("+ {}={}", attr, rex);
                    pairs.push((attr.to_string(), rex));
                }
                Err(err) => warn!("ignoring bad regex in {}: {}: {}", name, token, err),
            }
        }

        if pairs.is_empty() {
            let label = format!("no usable pairs in filter {}", name);
            return Err(Error::Parse(label));
        }

        Ok(UeventFilter {
            name: name.to_string(),
            pairs,
            matches: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reset(&mut self) {
        self.matches = 0;
    }

    /// Offer one attribute of the uevent to the filter, counting a match
    /// when a pair with this attribute name accepts the whole value.
    pub fn feed(&mut self, attr: &str, value: &str) -> bool {
        for (name, rex) in self.pairs.iter() {
            if name != attr {
                continue;
            }
            if !rex.is_match(value) {
                continue;
            }

            trace!("matched filter {}", self.name);
            self.matches += 1;
            return true;
        }

        false
    }

    /// Whether every pair of the filter found its attribute since the last
    /// reset.
    pub fn satisfied(&self) -> bool {
        !self.pairs.is_empty() && self.matches == self.pairs.len()
    }
}
