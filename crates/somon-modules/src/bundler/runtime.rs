// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! CommonJS bundle layout

/// Runtime that evaluates the module map. Ids missing from the map fall
/// through to the host `require`.
const PRELUDE: &str = r#"(function (modules, entry) {
  var cache = {};
  var has = Object.prototype.hasOwnProperty;
  function hostRequire(id) {
    if (typeof require === "function") return require(id);
    throw new Error("Cannot find module '" + id + "'");
  }
  function load(id) {
    if (has.call(cache, id)) return cache[id].exports;
    var module = { exports: {} };
    cache[id] = module;
    modules[id].call(module.exports, module, module.exports, function (request) {
      return has.call(modules, request) ? load(request) : hostRequire(request);
    });
    return module.exports;
  }
  var result = load(entry);
  if (typeof module !== "undefined") module.exports = result;
  return result;
})({"#;

/// A module ready to be placed in the bundle
#[derive(Debug, Clone)]
pub struct BundledModule {
    /// Bundle id
    pub id: String,
    /// Code with intra-bundle requires rewritten
    pub code: String,
}

/// Rendered bundle text
#[derive(Debug, Clone)]
pub struct Rendered {
    /// The bundle
    pub code: String,
    /// 0-based line on which each module's code starts, parallel to the input
    pub start_lines: Vec<usize>,
}

/// Lay out `modules` in order and start `entry`
pub fn render(modules: &[BundledModule], entry: &str) -> Rendered {
    let mut code = String::from(PRELUDE);
    let mut line = PRELUDE.matches('\n').count();
    let mut start_lines = Vec::with_capacity(modules.len());

    for (i, module) in modules.iter().enumerate() {
        let separator = if i == 0 { "\n" } else { ",\n" };
        code.push_str(separator);
        code.push_str(&quote(&module.id));
        code.push_str(": function (module, exports, require) {\n");
        line += 2;
        start_lines.push(line);

        code.push_str(&module.code);
        line += module.code.matches('\n').count();
        code.push_str("\n}");
        line += 1;
    }

    code.push_str("\n}, ");
    code.push_str(&quote(entry));
    code.push_str(");\n");

    Rendered { code, start_lines }
}

/// JSON string literal, which is also a valid JavaScript string literal
pub fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_start_lines() {
        let modules = vec![
            BundledModule {
                id: "./a.som".into(),
                code: "exports.a = 1;\nexports.b = 2;".into(),
            },
            BundledModule {
                id: "./main.som".into(),
                code: "require(\"./a.som\");".into(),
            },
        ];
        let rendered = render(&modules, "./main.som");
        let lines: Vec<&str> = rendered.code.lines().collect();

        assert_eq!(lines[rendered.start_lines[0]], "exports.a = 1;");
        assert_eq!(lines[rendered.start_lines[0] + 1], "exports.b = 2;");
        assert_eq!(lines[rendered.start_lines[1]], "require(\"./a.som\");");
        assert_eq!(lines[rendered.start_lines[1] - 1], "\"./main.som\": function (module, exports, require) {");
        assert!(rendered.code.ends_with("}, \"./main.som\");\n"));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("./a\"b.som"), "\"./a\\\"b.som\"");
        assert_eq!(quote("./дарс.som"), "\"./дарс.som\"");
    }
}
