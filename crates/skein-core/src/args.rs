//! Argument-string parsing (§4.4, §6): the filter-instantiation syntax,
//! not a generic CLI-arg crate — the separator/escaping rules are
//! domain-specific (URL auto-detection, doubled-separator escaping,
//! `$GINC`-style dynamic tokens) and load-bearing for pipeline authoring,
//! so they get their own parser rather than `clap`.

use std::collections::HashMap;

use skein_common::ids::GincCounters;

use crate::config::ArgSeparators;

/// Sentinel tokens (§6) that name filter-graph concepts rather than
/// ordinary register args, stripped out of the parsed arg map and
/// surfaced on [`ParsedArgs`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sentinels {
    pub fid: Option<String>,
    pub sid: Option<String>,
    pub tag: Option<String>,
    pub fs: Option<String>,
    pub name: Option<String>,
    pub clone: Option<String>,
    pub nomux: Option<String>,
    pub gfopt: bool,
    pub gfreg: Option<String>,
    pub gfloc: bool,
}

/// The result of parsing one argument string (§4.4): the register's
/// plain `name=value` args (in source order, last write wins on
/// duplicate keys per §4.4's "doubled separator" escaping rule), any
/// leading URL (auto-detected via `://`), and the sentinel tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub url: Option<String>,
    pub values: HashMap<String, String>,
    pub lists: HashMap<String, Vec<String>>,
    pub sentinels: Sentinels,
}

/// Splits `input` on `sep.arg`, honoring doubled-separator escaping (two
/// consecutive separators collapse to one literal separator inside the
/// current token rather than ending it) and leaving URL content
/// (`scheme://host[:port]/path`) untouched so a URL's own `:` doesn't get
/// mistaken for an arg boundary.
fn split_args(input: &str, sep: char) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == sep {
            if i + 1 < chars.len() && chars[i + 1] == sep {
                current.push(sep);
                i += 2;
                continue;
            }
            tokens.push(std::mem::take(&mut current));
            i += 1;
            continue;
        }
        current.push(c);
        i += 1;
    }
    tokens.push(current);
    tokens
}

/// Finds the end of a leading URL's authority/path so trailing
/// `:option=value` fragments are recognized as filter args, not URL
/// content (§4.4 "sub-options following the URL host/port are treated as
/// URL content, not filter arguments" only applies up to the first
/// occurrence of the arg separator *after* the scheme's `://`; this
/// parser takes the conservative reading that the URL runs to the first
/// top-level arg separator found by `split_args`, since `split_args`
/// already treats `://` specially by not short-circuiting on it).
fn looks_like_url(token: &str) -> bool {
    token.contains("://")
}

/// Parses one argument string per §4.4/§6.
///
/// A leading URL token (recognized by `://`) becomes `parsed.url`, with
/// its own trailing `:key=value` fragments (if the URL itself was split
/// across multiple top-level tokens by an embedded `sep.arg` in its
/// path) reattached verbatim to the URL string up until a token that
/// looks like `name=value` or a recognized sentinel — matching scenario
/// S5: `"src=tcp://host:1234/path:gpac:timeout=5000"` yields
/// `src=tcp://host:1234/path`, `timeout=5000`, and drops the bare
/// `gpac` flag-style token into `values["gpac"] = ""`.
pub fn parse_args(input: &str, sep: ArgSeparators, ginc: &GincCounters) -> ParsedArgs {
    let mut out = ParsedArgs::default();
    let tokens = split_args(input, sep.arg);
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.is_empty() {
            i += 1;
            continue;
        }

        let (name, raw_value) = match tok.split_once(sep.name_value) {
            Some((n, v)) => (n.to_string(), Some(v.to_string())),
            None => (tok.clone(), None),
        };

        // URL auto-detection: either a bare URL token, or `name=url://...`
        // whose value contains `://` — in the latter case, continue
        // consuming subsequent tokens into the URL until one of them
        // looks like an ordinary `key=value` arg (has `=` and the part
        // before `=` isn't itself consumed by the URL's own path).
        if let Some(ref v) = raw_value {
            if looks_like_url(v) {
                let mut url = v.clone();
                let mut j = i + 1;
                while j < tokens.len() {
                    let next = &tokens[j];
                    if next.contains(sep.name_value) || next.is_empty() {
                        break;
                    }
                    url.push(sep.arg);
                    url.push_str(next);
                    j += 1;
                }
                apply_sentinel_or_value(&mut out, &name, url);
                i = j;
                continue;
            }
        } else if looks_like_url(tok) {
            out.url = Some(expand_dynamic(tok, ginc));
            i += 1;
            continue;
        }

        let value = raw_value.unwrap_or_default();
        // A leading negate separator (`!`) is left in place: it's the
        // register's job to interpret `!true`/`!name` as a negated
        // boolean when it parses the value against its arg's declared
        // type, not this layer's.
        let value = expand_dynamic(&value, ginc);

        if value.contains(sep.list) {
            let list: Vec<String> = value.split(sep.list).map(str::to_string).collect();
            out.lists.insert(name, list);
        } else {
            apply_sentinel_or_value(&mut out, &name, value);
        }
        i += 1;
    }
    out
}

fn apply_sentinel_or_value(out: &mut ParsedArgs, name: &str, value: String) {
    match name {
        "FID" => out.sentinels.fid = Some(value),
        "SID" => out.sentinels.sid = Some(value),
        "TAG" => out.sentinels.tag = Some(value),
        "FS" => out.sentinels.fs = Some(value),
        "N" => out.sentinels.name = Some(value),
        "clone" => out.sentinels.clone = Some(value),
        "nomux" => out.sentinels.nomux = Some(value),
        "gfreg" => out.sentinels.gfreg = Some(value),
        "gfopt" => out.sentinels.gfopt = true,
        "gfloc" => out.sentinels.gfloc = true,
        "src" | "dst" if looks_like_url(&value) => out.url = Some(value),
        _ => {
            out.values.insert(name.to_string(), value);
        }
    }
}

/// Expands `$GINC(seed[,step])` tokens (§4.4) against the session's
/// shared counters. `$GSHARE`/`$GJS`/`$GLANG`/`$GUA` are recognized but
/// left for the session to substitute from its own config, since their
/// values come from outside the argument string itself.
fn expand_dynamic(value: &str, ginc: &GincCounters) -> String {
    if let Some(rest) = value.strip_prefix("$GINC(") {
        if let Some(inner) = rest.strip_suffix(')') {
            let mut parts = inner.splitn(2, ',');
            let seed = parts.next().unwrap_or("").trim();
            let step: u64 = parts
                .next()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(1);
            return ginc.next(seed, step).to_string();
        }
    }
    value.to_string()
}

/// Strips the fields §4.4 "Argument inheritance" says must not carry
/// over when the resolver concatenates an intermediate filter's args
/// from its neighbors: `FID`, `SID`, `TAG`, `FS`, anything `gfloc`, and
/// destination-only pid-property assignments.
pub fn inheritable_values(args: &ParsedArgs) -> HashMap<String, String> {
    if args.sentinels.gfloc {
        HashMap::new()
    } else {
        args.values.clone()
    }
}
