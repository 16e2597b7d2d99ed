//! Capability bundles and the link resolver (§4.5).

use std::collections::{HashSet, VecDeque};

use crate::property::PropertyValue;

/// Per-cap flags (§4.5): direction, exclusion, and negotiation scope.
/// Plain bit constants over a `u8` rather than the `bitflags` crate — this
/// workspace doesn't otherwise depend on it and eight bits don't warrant
/// adding it for this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapFlags(u8);

impl CapFlags {
    pub const INPUT: CapFlags = CapFlags(1 << 0);
    pub const OUTPUT: CapFlags = CapFlags(1 << 1);
    pub const EXCLUDED: CapFlags = CapFlags(1 << 2);
    pub const STATIC: CapFlags = CapFlags(1 << 3);
    pub const LOADED_FILTER_ONLY: CapFlags = CapFlags(1 << 4);
    /// Marks a bundle boundary (`IN_BUNDLE` in the capability-list
    /// vocabulary); modeled here as a flag rather than an implicit
    /// array-splitting sentinel, since bundles are already their own
    /// `CapBundle` struct.
    pub const IN_BUNDLE: CapFlags = CapFlags(1 << 5);
    /// An INPUT cap the destination insists on for a *direct* match but
    /// that the relaxed retry pass (§4.5 "Runtime resolution") is allowed
    /// to ignore when strict matching finds no path at all.
    pub const FORCED: CapFlags = CapFlags(1 << 6);

    pub fn contains(&self, other: CapFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: CapFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for CapFlags {
    type Output = CapFlags;
    fn bitor(self, rhs: CapFlags) -> CapFlags {
        CapFlags(self.0 | rhs.0)
    }
}

/// A single `(key, value, flags)` capability entry.
#[derive(Debug, Clone)]
pub struct Cap {
    pub key: &'static str,
    pub value: PropertyValue,
    pub flags: CapFlags,
    /// Per-cap priority, breaks ties in bundle matching.
    pub priority: i32,
}

impl Cap {
    pub fn output(key: &'static str, value: PropertyValue) -> Self {
        Cap {
            key,
            value,
            flags: CapFlags::OUTPUT,
            priority: 0,
        }
    }
    pub fn input(key: &'static str, value: PropertyValue) -> Self {
        Cap {
            key,
            value,
            flags: CapFlags::INPUT,
            priority: 0,
        }
    }
    pub fn excluded(mut self) -> Self {
        self.flags.insert(CapFlags::EXCLUDED);
        self
    }
    pub fn with_priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }
}

/// An ordered set of caps forming one bundle (§4.5).
#[derive(Debug, Clone, Default)]
pub struct CapBundle {
    pub caps: Vec<Cap>,
    /// Per-register priority, breaks ties across registers offering an
    /// otherwise-equal match.
    pub register_priority: i32,
}

impl CapBundle {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_cap(mut self, cap: Cap) -> Self {
        self.caps.push(cap);
        self
    }

    fn caps_with_key<'a>(&'a self, key: &str, dir: CapFlags) -> impl Iterator<Item = &'a Cap> {
        self.caps
            .iter()
            .filter(move |c| c.key == key && c.flags.contains(dir))
    }
}

/// Bundle-to-bundle match per §4.5: for every OUTPUT cap in `src` with key
/// `k`, the INPUT caps in `dst` with the same key must include a
/// non-excluded match and must not include an excluded match.
pub fn bundles_match(src: &CapBundle, dst: &CapBundle) -> bool {
    bundles_match_impl(src, dst, false)
}

/// Same as [`bundles_match`] but ignores any destination cap flagged
/// [`CapFlags::FORCED`], as if the destination hadn't restricted that key
/// at all. Used for the relaxed retry pass once strict resolution finds no
/// path (§4.5 "Runtime resolution": "ignore the destination's
/// `forced_caps` and retry once").
pub fn bundles_match_relaxed(src: &CapBundle, dst: &CapBundle) -> bool {
    bundles_match_impl(src, dst, true)
}

fn bundles_match_impl(src: &CapBundle, dst: &CapBundle, ignore_forced: bool) -> bool {
    for out_cap in src.caps.iter().filter(|c| c.flags.contains(CapFlags::OUTPUT)) {
        let dst_caps: Vec<&Cap> = dst
            .caps_with_key(out_cap.key, CapFlags::INPUT)
            .filter(|c| !(ignore_forced && c.flags.contains(CapFlags::FORCED)))
            .collect();
        if dst_caps.is_empty() {
            // Destination doesn't restrict this key at all: always matches.
            continue;
        }
        let mut found_match = false;
        let mut excluded_match = false;
        for in_cap in &dst_caps {
            let equal = crate::property::equal(&out_cap.value, &in_cap.value);
            if !equal {
                continue;
            }
            if in_cap.flags.contains(CapFlags::EXCLUDED) {
                excluded_match = true;
            } else {
                found_match = true;
            }
        }
        if excluded_match || !found_match {
            return false;
        }
    }
    true
}

/// A precomputed edge in the registry-wide capability graph (§4.5).
#[derive(Debug, Clone)]
pub struct Edge {
    pub src_register: usize,
    pub dst_register: usize,
    pub src_bundle: usize,
    pub dst_bundle: usize,
    pub weight: i32,
    pub priority: i32,
}

/// The precomputed graph over all registered filter classes. `relaxed_edges`
/// holds the additional edges that only match once [`CapFlags::FORCED`]
/// destination caps are ignored (§4.5's relaxed retry); they're kept
/// separate from `edges` so strict resolution never silently picks one up.
#[derive(Debug, Default)]
pub struct RegDescGraph {
    pub edges: Vec<Edge>,
    pub relaxed_edges: Vec<Edge>,
}

impl RegDescGraph {
    /// Builds the graph from a slice of `(register_index, output_bundles,
    /// input_bundles, register_priority, flags)` descriptors.
    pub fn build(registers: &[(usize, &[CapBundle], &[CapBundle], i32, crate::filter::RegisterFlags)]) -> Self {
        let mut edges = Vec::new();
        let mut relaxed_edges = Vec::new();
        for &(src_idx, src_outputs, _src_inputs, src_prio, src_flags) in registers {
            for &(dst_idx, _dst_outputs, dst_inputs, dst_prio, _dst_flags) in registers {
                if src_idx == dst_idx {
                    continue;
                }
                for (sb_idx, src_bundle) in src_outputs.iter().enumerate() {
                    for (db_idx, dst_bundle) in dst_inputs.iter().enumerate() {
                        let script_penalty = if src_flags.contains(crate::filter::RegisterFlags::SCRIPT)
                            || src_flags.contains(crate::filter::RegisterFlags::META)
                        {
                            100
                        } else {
                            0
                        };
                        let strict = bundles_match(src_bundle, dst_bundle);
                        if strict || bundles_match_relaxed(src_bundle, dst_bundle) {
                            let edge = Edge {
                                src_register: src_idx,
                                dst_register: dst_idx,
                                src_bundle: sb_idx,
                                dst_bundle: db_idx,
                                weight: 1 + script_penalty,
                                priority: src_prio + dst_prio,
                            };
                            if strict {
                                edges.push(edge);
                            } else {
                                relaxed_edges.push(edge);
                            }
                        }
                    }
                }
            }
        }
        RegDescGraph { edges, relaxed_edges }
    }

    /// BFS from `src_register` to `dst_register` over the precomputed
    /// class-level capability graph, skipping registers named in
    /// `blacklist`. Returns the ordered chain of intermediate register
    /// indices, if any (`resolve_link`, §4.5).
    ///
    /// Cycle avoidance against the *live* instance graph (§4.5 "Cycle
    /// avoidance": skip a candidate that would close a loop among
    /// already-connected filters, unless it carries `ALLOW_CYCLIC`) isn't
    /// something this register-class-level graph can decide on its own —
    /// every intermediate adapter this BFS names is a fresh instance with
    /// no live connections yet, so the only edge that can ever close a loop
    /// with something that already exists is the final hop onto the
    /// caller's own `dst_register`, which this method doesn't even resolve
    /// itself (it just terminates the BFS there). [`Session::connect`]
    /// checks that case against the live filter graph and refuses the
    /// connection up front when it would close a cycle the destination
    /// isn't flagged to allow, before ever calling in here.
    ///
    /// [`Session::connect`]: crate::session::Session::connect
    pub fn resolve_chain(
        &self,
        src_register: usize,
        dst_register: usize,
        blacklist: &HashSet<usize>,
        max_chain_len: usize,
    ) -> Option<Vec<usize>> {
        self.resolve_chain_with(src_register, dst_register, blacklist, max_chain_len, false)
    }

    /// Strict resolution first; if that finds nothing, retries once with
    /// `FORCED` destination caps ignored (§4.5 "If nothing found with
    /// strict matching, relax... and retry once").
    pub fn resolve_chain_relaxed(
        &self,
        src_register: usize,
        dst_register: usize,
        blacklist: &HashSet<usize>,
        max_chain_len: usize,
    ) -> Option<Vec<usize>> {
        self.resolve_chain(src_register, dst_register, blacklist, max_chain_len)
            .or_else(|| self.resolve_chain_with(src_register, dst_register, blacklist, max_chain_len, true))
    }

    fn resolve_chain_with(
        &self,
        src_register: usize,
        dst_register: usize,
        blacklist: &HashSet<usize>,
        max_chain_len: usize,
        relaxed: bool,
    ) -> Option<Vec<usize>> {
        if src_register == dst_register {
            return Some(vec![]);
        }
        let mut visited = HashSet::new();
        visited.insert(src_register);
        let mut queue = VecDeque::new();
        queue.push_back((src_register, vec![]));

        while let Some((current, path)) = queue.pop_front() {
            if path.len() >= max_chain_len {
                continue;
            }
            let mut candidates: Vec<&Edge> = self
                .edges
                .iter()
                .chain(relaxed.then_some(()).into_iter().flat_map(|_| self.relaxed_edges.iter()))
                .filter(|e| e.src_register == current && !blacklist.contains(&e.dst_register))
                .collect();
            candidates.sort_by(|a, b| (b.priority, -a.weight).cmp(&(a.priority, -b.weight)));

            for edge in candidates {
                let next = edge.dst_register;
                if next == dst_register {
                    let mut full_path = path.clone();
                    full_path.push(next);
                    return Some(full_path);
                }
                if visited.insert(next) {
                    let mut next_path = path.clone();
                    next_path.push(next);
                    queue.push_back((next, next_path));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RegisterFlags;
    use crate::property::PropertyValue;

    fn codec_cap(dir: CapFlags, codec: &'static str) -> Cap {
        Cap {
            key: "codec_id",
            value: PropertyValue::String(codec.to_string()),
            flags: dir,
            priority: 0,
        }
    }

    #[test]
    fn bundle_match_respects_excluded_values() {
        let src = CapBundle::new().with_cap(codec_cap(CapFlags::OUTPUT, "RAW"));
        let ok_dst = CapBundle::new().with_cap(codec_cap(CapFlags::INPUT, "RAW"));
        assert!(bundles_match(&src, &ok_dst));

        let excluded_dst =
            CapBundle::new().with_cap(codec_cap(CapFlags::INPUT, "RAW").excluded());
        assert!(!bundles_match(&src, &excluded_dst));

        let unrestricted_dst = CapBundle::new();
        assert!(bundles_match(&src, &unrestricted_dst));
    }

    #[test]
    fn forced_cap_blocks_strict_match_but_relaxed_retry_finds_it() {
        let src = CapBundle::new().with_cap(codec_cap(CapFlags::OUTPUT, "X"));
        let mut forced_in = codec_cap(CapFlags::INPUT, "RAW");
        forced_in.flags.insert(CapFlags::FORCED);
        let dst = CapBundle::new().with_cap(forced_in);

        assert!(!bundles_match(&src, &dst), "strict match must respect the forced cap");
        assert!(
            bundles_match_relaxed(&src, &dst),
            "relaxed match ignores the forced cap and falls back to unrestricted"
        );

        let registers = vec![
            (0usize, std::slice::from_ref(&src), [].as_slice(), 0, RegisterFlags::empty()),
            (1usize, [].as_slice(), std::slice::from_ref(&dst), 0, RegisterFlags::empty()),
        ];
        let graph = RegDescGraph::build(&registers);
        assert!(graph.resolve_chain(0, 1, &HashSet::new(), 8).is_none());
        assert_eq!(graph.resolve_chain_relaxed(0, 1, &HashSet::new(), 8), Some(vec![1]));
    }

    #[test]
    fn scenario_s2_auto_resolve_one_step() {
        // A (out codec=X) -> B (in codec=X, out codec=RAW) -> C (in codec=RAW)
        let a_out = vec![CapBundle::new().with_cap(codec_cap(CapFlags::OUTPUT, "X"))];
        let b_in = vec![CapBundle::new().with_cap(codec_cap(CapFlags::INPUT, "X"))];
        let b_out = vec![CapBundle::new().with_cap(codec_cap(CapFlags::OUTPUT, "RAW"))];
        let c_in = vec![CapBundle::new().with_cap(codec_cap(CapFlags::INPUT, "RAW"))];
        let no_bundles: Vec<CapBundle> = vec![];

        let registers = vec![
            (0usize, a_out.as_slice(), no_bundles.as_slice(), 0, RegisterFlags::empty()),
            (1usize, b_out.as_slice(), b_in.as_slice(), 0, RegisterFlags::empty()),
            (2usize, no_bundles.as_slice(), c_in.as_slice(), 0, RegisterFlags::empty()),
        ];
        let graph = RegDescGraph::build(&registers);
        let chain = graph
            .resolve_chain(0, 2, &HashSet::new(), 8)
            .expect("resolver should find A -> B -> C");
        assert_eq!(chain, vec![1, 2]);
    }

    #[test]
    fn blacklisted_register_is_skipped() {
        let a_out = vec![CapBundle::new().with_cap(codec_cap(CapFlags::OUTPUT, "X"))];
        let b_in = vec![CapBundle::new().with_cap(codec_cap(CapFlags::INPUT, "X"))];
        let registers = vec![
            (0usize, a_out.as_slice(), [].as_slice(), 0, RegisterFlags::empty()),
            (1usize, [].as_slice(), b_in.as_slice(), 0, RegisterFlags::empty()),
        ];
        let graph = RegDescGraph::build(&registers);
        let mut blacklist = HashSet::new();
        blacklist.insert(1);
        assert!(graph.resolve_chain(0, 1, &blacklist, 8).is_none());
    }
}
