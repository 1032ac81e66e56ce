// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Revision 3 source maps at line granularity

use serde::{Deserialize, Serialize};

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// A source map document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    /// Always 3
    pub version: u8,
    /// Bundle ids of the original modules
    pub sources: Vec<String>,
    /// Original source text, parallel to `sources`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_content: Option<Vec<String>>,
    /// Unused; kept for consumers that require the field
    pub names: Vec<String>,
    /// Base64 VLQ mappings
    pub mappings: String,
}

/// Builds a map where each generated line points at the start of one original line
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    contents: Vec<String>,
    lines: Vec<Option<(usize, usize)>>,
}

impl SourceMapBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an original source, returning its index
    pub fn add_source(&mut self, id: impl Into<String>, content: impl Into<String>) -> usize {
        self.sources.push(id.into());
        self.contents.push(content.into());
        self.sources.len() - 1
    }

    /// Map 0-based `generated_line` to 0-based `original_line` of `source`
    pub fn map_line(&mut self, generated_line: usize, source: usize, original_line: usize) {
        if self.lines.len() <= generated_line {
            self.lines.resize(generated_line + 1, None);
        }
        self.lines[generated_line] = Some((source, original_line));
    }

    /// Finish the map
    pub fn build(self, inline_sources: bool) -> SourceMap {
        let mut mappings = String::new();
        let mut prev_source = 0i64;
        let mut prev_line = 0i64;

        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                mappings.push(';');
            }
            if let Some((source, original_line)) = line {
                let (source, original_line) = (*source as i64, *original_line as i64);
                encode_vlq(&mut mappings, 0);
                encode_vlq(&mut mappings, source - prev_source);
                encode_vlq(&mut mappings, original_line - prev_line);
                encode_vlq(&mut mappings, 0);
                prev_source = source;
                prev_line = original_line;
            }
        }

        SourceMap {
            version: 3,
            sources: self.sources,
            sources_content: inline_sources.then_some(self.contents),
            names: Vec::new(),
            mappings,
        }
    }
}

fn encode_vlq(out: &mut String, value: i64) {
    let mut rest = if value < 0 {
        ((-value as u64) << 1) | 1
    } else {
        (value as u64) << 1
    };
    loop {
        let mut digit = (rest & 31) as usize;
        rest >>= 5;
        if rest > 0 {
            digit |= 32;
        }
        out.push(BASE64[digit] as char);
        if rest == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vlq(value: i64) -> String {
        let mut out = String::new();
        encode_vlq(&mut out, value);
        out
    }

    #[test]
    fn test_vlq_encoding() {
        assert_eq!(vlq(0), "A");
        assert_eq!(vlq(1), "C");
        assert_eq!(vlq(-1), "D");
        assert_eq!(vlq(15), "e");
        assert_eq!(vlq(16), "gB");
        assert_eq!(vlq(-17), "jB");
        assert_eq!(vlq(1000), "w+B");
    }

    #[test]
    fn test_line_mappings() {
        let mut builder = SourceMapBuilder::new();
        let a = builder.add_source("./a.som", "x\ny");
        let b = builder.add_source("./b.som", "z");
        builder.map_line(1, a, 0);
        builder.map_line(2, a, 1);
        builder.map_line(4, b, 0);
        let map = builder.build(false);

        assert_eq!(map.mappings, ";AAAA;AACA;;ACDA");
        assert_eq!(map.sources, vec!["./a.som", "./b.som"]);
        assert!(map.sources_content.is_none());
        let json = serde_json::to_string(&map).unwrap();
        assert!(!json.contains("sourcesContent"));
    }

    #[test]
    fn test_inline_sources() {
        let mut builder = SourceMapBuilder::new();
        builder.add_source("./a.som", "чоп.сабт(1);");
        let map = builder.build(true);
        assert_eq!(map.sources_content, Some(vec!["чоп.сабт(1);".to_string()]));
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\"sourcesContent\":[\"чоп.сабт(1);\"]"));
    }
}
