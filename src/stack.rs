//! Call stack reconstruction from sampled profiles.
//!
//! A V8 CPU profile records, for each sample, only the call-tree node at the
//! top of the stack. [`ProfileState::advance`] turns each new sample into the
//! minimal run of end/begin events that moves the previously reconstructed
//! stack to the one implied by that node's ancestry.

use crate::trace::{CallFrame, ProfileNode, SpallEvent};
use log::warn;
use std::collections::HashMap;

/// Node ID standing in for "no node": an empty stack's top, or a root's parent.
pub const ROOT_ID: u64 = 0;

const GC_CODE_TYPE: &str = "other";
const GC_FUNCTION_NAME: &str = "(garbage collector)";

/// Reconstruction state for a single process.
#[derive(Debug, Clone)]
pub struct ProfileState {
    /// Start time from the `Profile` event, in microseconds.
    pub start_time: i64,
    /// Current virtual time: the start time plus every delta seen so far.
    pub clock: i64,
    /// Every call-tree node seen for this profile.
    pub nodes: HashMap<u64, ProfileNode>,
    /// Open frames, bottom to top. May hold the same ID more than once
    /// when garbage collector frames are pushed.
    pub stack: Vec<u64>,
    /// Thread ID of the most recent chunk.
    pub tid: i64,
}

impl ProfileState {
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            clock: start_time,
            nodes: HashMap::new(),
            stack: Vec::new(),
            tid: 0,
        }
    }

    /// Add nodes to the call tree.
    ///
    /// A node is immutable once known: a later definition of the same ID is
    /// ignored, with a warning if its content differs. Returns the number of
    /// nodes that were new.
    pub fn merge_nodes(&mut self, nodes: Vec<ProfileNode>) -> usize {
        let mut added = 0;
        for node in nodes {
            match self.nodes.get(&node.id) {
                Some(existing) if *existing != node => {
                    warn!(
                        "Node {} redefined with different content; keeping the first definition",
                        node.id
                    );
                }
                Some(_) => {}
                None => {
                    self.nodes.insert(node.id, node);
                    added += 1;
                }
            }
        }
        added
    }

    /// Virtual time elapsed since the profile started.
    pub fn elapsed(&self) -> i64 {
        self.clock.saturating_sub(self.start_time)
    }

    /// Current top of the stack, or [`ROOT_ID`] if the stack is empty.
    pub fn top(&self) -> u64 {
        self.stack.last().copied().unwrap_or(ROOT_ID)
    }

    fn parent_of(&self, id: u64) -> u64 {
        self.nodes.get(&id).map_or(ROOT_ID, |node| node.parent)
    }

    fn frame_of(&self, id: u64) -> Option<&CallFrame> {
        self.nodes.get(&id).map(|node| &node.call_frame)
    }

    /// Feed one sample to the state, appending the resulting events.
    ///
    /// `sample` is the node at the top of the stack once `delta`
    /// microseconds have elapsed since the previous sample.
    pub fn advance(
        &mut self,
        pid: i64,
        tid: i64,
        sample: u64,
        delta: i64,
        events: &mut Vec<SpallEvent>,
    ) {
        // Deltas come straight from the input; clamp rather than overflow.
        self.clock = self.clock.saturating_add(delta);
        let ts = self.clock;

        if self.top() == sample {
            return;
        }

        let frame = self.frame_of(sample);
        if frame.is_none() {
            warn!("Sample references unknown node {sample} in pid {pid}; treating it as a root");
        }

        // Garbage collector frames are not part of the real call chain. Push
        // them unconditionally; the next real stack change pops them.
        if frame.is_some_and(is_gc_frame) {
            events.push(SpallEvent::begin(GC_FUNCTION_NAME, pid, tid, ts));
            self.stack.push(sample);
            return;
        }

        let (ancestor, to_open) = self.find_ancestor(sample);

        let keep = ancestor.map_or(0, |index| index + 1);
        while self.stack.len() > keep {
            self.stack.pop();
            events.push(SpallEvent::end(pid, tid, ts));
        }

        for &id in to_open.iter().rev() {
            let name = self.frame_of(id).map_or_else(
                || frame_name(&CallFrame::default()),
                frame_name,
            );
            events.push(SpallEvent::begin(name, pid, tid, ts));
            self.stack.push(id);
        }
    }

    /// Find the index of the stack entry to keep, and the nodes to open
    /// above it (leaf first).
    ///
    /// `None` means nothing on the stack is an ancestor of `sample`.
    fn find_ancestor(&self, sample: u64) -> (Option<usize>, Vec<u64>) {
        // Returning to a frame already on the stack only pops. Prefer the
        // occurrence nearest the top.
        if let Some(index) = self.stack.iter().rposition(|&id| id == sample) {
            return (Some(index), Vec::new());
        }

        let mut to_open = Vec::new();
        let mut current = sample;
        while current != ROOT_ID {
            if let Some(index) = self.stack.iter().rposition(|&id| id == current) {
                return (Some(index), to_open);
            }
            to_open.push(current);

            // A well-formed call tree has no chain longer than the node table.
            if to_open.len() > self.nodes.len() {
                warn!("Parent chain of node {sample} does not reach a root; truncating");
                break;
            }
            current = self.parent_of(current);
        }

        (None, to_open)
    }

    /// Close every open frame at the current clock, topmost first.
    pub fn close_all(&mut self, pid: i64, tid: i64, events: &mut Vec<SpallEvent>) {
        while self.stack.pop().is_some() {
            events.push(SpallEvent::end(pid, tid, self.clock));
        }
    }
}

/// Whether a frame is V8's garbage collector pseudo-frame.
pub fn is_gc_frame(frame: &CallFrame) -> bool {
    frame.code_type == GC_CODE_TYPE && frame.function_name == GC_FUNCTION_NAME
}

/// Display name for a frame, synthesizing one for anonymous functions.
pub fn frame_name(frame: &CallFrame) -> String {
    if frame.function_name.is_empty() {
        format!(
            "(anonymous {}:{}:{})",
            frame.script_id, frame.line_number, frame.column_number
        )
    } else {
        frame.function_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: i64 = 1;
    const TID: i64 = 2;

    fn node(id: u64, parent: u64, name: &str) -> ProfileNode {
        ProfileNode {
            id,
            parent,
            call_frame: CallFrame {
                code_type: "JS".to_string(),
                function_name: name.to_string(),
                ..Default::default()
            },
        }
    }

    fn gc_node(id: u64, parent: u64) -> ProfileNode {
        ProfileNode {
            id,
            parent,
            call_frame: CallFrame {
                code_type: "other".to_string(),
                function_name: "(garbage collector)".to_string(),
                ..Default::default()
            },
        }
    }

    /// Call tree used by most tests:
    ///
    /// ```text
    /// 1 root
    /// ├── 2 main
    /// │   ├── 3 work
    /// │   │   └── 4 inner
    /// │   └── 5 other
    /// └── 6 idle
    /// ```
    fn state() -> ProfileState {
        let mut state = ProfileState::new(1000);
        state.merge_nodes(vec![
            node(1, 0, "root"),
            node(2, 1, "main"),
            node(3, 2, "work"),
            node(4, 3, "inner"),
            node(5, 2, "other"),
            node(6, 1, "idle"),
        ]);
        state
    }

    fn advance(state: &mut ProfileState, sample: u64, delta: i64) -> Vec<SpallEvent> {
        let mut events = Vec::new();
        state.advance(PID, TID, sample, delta, &mut events);
        events
    }

    fn begin(name: &str, ts: i64) -> SpallEvent {
        SpallEvent::begin(name, PID, TID, ts)
    }

    fn end(ts: i64) -> SpallEvent {
        SpallEvent::end(PID, TID, ts)
    }

    #[test]
    fn first_sample_opens_single_root() {
        let mut state = ProfileState::new(1000);
        state.merge_nodes(vec![node(1, 0, "f")]);

        let events = advance(&mut state, 1, 5);

        assert_eq!(events, vec![begin("f", 1005)]);
        assert_eq!(state.stack, vec![1]);
        assert_eq!(state.clock, 1005);
    }

    #[test]
    fn first_sample_opens_whole_chain_root_first() {
        let mut state = state();
        let events = advance(&mut state, 4, 10);

        assert_eq!(
            events,
            vec![
                begin("root", 1010),
                begin("main", 1010),
                begin("work", 1010),
                begin("inner", 1010),
            ]
        );
        assert_eq!(state.stack, vec![1, 2, 3, 4]);
    }

    #[test]
    fn same_sample_only_advances_clock() {
        let mut state = state();
        advance(&mut state, 3, 10);

        let events = advance(&mut state, 3, 7);

        assert!(events.is_empty());
        assert_eq!(state.clock, 1017);
        assert_eq!(state.stack, vec![1, 2, 3]);
    }

    #[test]
    fn child_of_top_pushes_one_frame() {
        let mut state = state();
        advance(&mut state, 3, 0);

        let events = advance(&mut state, 4, 1);

        assert_eq!(events, vec![begin("inner", 1001)]);
        assert_eq!(state.stack, vec![1, 2, 3, 4]);
    }

    #[test]
    fn returning_to_ancestor_only_pops() {
        let mut state = state();
        advance(&mut state, 3, 0);
        assert_eq!(state.stack, vec![1, 2, 3]);

        let events = advance(&mut state, 1, 4);

        assert_eq!(events, vec![end(1004), end(1004)]);
        assert_eq!(state.stack, vec![1]);
    }

    #[test]
    fn sibling_pops_then_pushes() {
        let mut state = state();
        advance(&mut state, 4, 0);

        let events = advance(&mut state, 5, 3);

        assert_eq!(events, vec![end(1003), end(1003), begin("other", 1003)]);
        assert_eq!(state.stack, vec![1, 2, 5]);
    }

    #[test]
    fn unrelated_chain_pops_everything() {
        let mut state = ProfileState::new(0);
        state.merge_nodes(vec![
            node(1, 0, "a"),
            node(2, 1, "b"),
            node(10, 0, "x"),
            node(11, 10, "y"),
        ]);
        advance(&mut state, 2, 1);

        let events = advance(&mut state, 11, 1);

        assert_eq!(events, vec![end(2), end(2), begin("x", 2), begin("y", 2)]);
        assert_eq!(state.stack, vec![10, 11]);
    }

    #[test]
    fn anonymous_frames_get_location_names() {
        let mut state = ProfileState::new(0);
        state.merge_nodes(vec![ProfileNode {
            id: 1,
            parent: 0,
            call_frame: CallFrame {
                code_type: "JS".to_string(),
                line_number: 12,
                column_number: 4,
                script_id: "7".to_string(),
                ..Default::default()
            },
        }]);

        let events = advance(&mut state, 1, 0);

        assert_eq!(events, vec![begin("(anonymous 7:12:4)", 0)]);
    }

    #[test]
    fn gc_frame_is_pushed_without_pops() {
        let mut state = state();
        state.merge_nodes(vec![gc_node(9, 1)]);
        advance(&mut state, 4, 0);

        let events = advance(&mut state, 9, 2);

        assert_eq!(events, vec![begin("(garbage collector)", 1002)]);
        assert_eq!(state.stack, vec![1, 2, 3, 4, 9]);
    }

    #[test]
    fn gc_frame_closes_on_next_change() {
        let mut state = state();
        state.merge_nodes(vec![gc_node(9, 1)]);
        advance(&mut state, 4, 0);
        advance(&mut state, 9, 2);

        // Back to the frame that was running before the collection.
        let events = advance(&mut state, 4, 3);

        assert_eq!(events, vec![end(1005)]);
        assert_eq!(state.stack, vec![1, 2, 3, 4]);
    }

    #[test]
    fn gc_frame_does_not_anchor_ancestor_search() {
        let mut state = state();
        state.merge_nodes(vec![gc_node(9, 1)]);
        advance(&mut state, 3, 0);
        advance(&mut state, 9, 1);

        // 5 is a child of 2; the search passes over the GC frame.
        let events = advance(&mut state, 5, 1);

        assert_eq!(events, vec![end(1002), end(1002), begin("other", 1002)]);
        assert_eq!(state.stack, vec![1, 2, 5]);
    }

    #[test]
    fn repeated_gc_sample_is_no_change() {
        let mut state = state();
        state.merge_nodes(vec![gc_node(9, 1)]);
        advance(&mut state, 2, 0);
        advance(&mut state, 9, 1);

        let events = advance(&mut state, 9, 1);

        assert!(events.is_empty());
        assert_eq!(state.stack, vec![1, 2, 9]);
    }

    #[test]
    fn duplicate_ids_match_topmost_occurrence() {
        let mut state = state();
        state.stack = vec![1, 2, 3, 2, 5];

        let events = advance(&mut state, 2, 1);

        assert_eq!(events, vec![end(1001)]);
        assert_eq!(state.stack, vec![1, 2, 3, 2]);
    }

    #[test]
    fn unknown_node_is_treated_as_root() {
        let mut state = state();
        advance(&mut state, 3, 0);

        let events = advance(&mut state, 99, 1);

        assert_eq!(
            events,
            vec![end(1001), end(1001), end(1001), begin("(anonymous 0:0:0)", 1001)]
        );
        assert_eq!(state.stack, vec![99]);
    }

    #[test]
    fn parent_cycle_is_truncated() {
        let mut state = ProfileState::new(0);
        state.merge_nodes(vec![node(1, 2, "a"), node(2, 1, "b")]);

        let events = advance(&mut state, 1, 0);

        assert!(events.iter().all(SpallEvent::is_begin));
        assert_eq!(events.len(), state.stack.len());
        assert!(state.stack.len() <= 3);
    }

    #[test]
    fn first_definition_of_node_wins() {
        let mut state = ProfileState::new(0);
        assert_eq!(state.merge_nodes(vec![node(1, 0, "first")]), 1);
        assert_eq!(state.merge_nodes(vec![node(1, 0, "second"), node(2, 1, "b")]), 1);

        assert_eq!(state.nodes[&1].call_frame.function_name, "first");
        assert_eq!(state.nodes.len(), 2);
    }

    #[test]
    fn clock_saturates_instead_of_overflowing() {
        let mut state = ProfileState::new(9_223_372_036_854_775_000);
        state.merge_nodes(vec![node(1, 0, "f"), node(2, 1, "g")]);

        let events = advance(&mut state, 1, 10_000);
        assert_eq!(events, vec![begin("f", i64::MAX)]);

        let events = advance(&mut state, 2, 1);
        assert_eq!(events, vec![begin("g", i64::MAX)]);
        assert_eq!(state.clock, i64::MAX);
    }

    #[test]
    fn elapsed_counts_from_start_time() {
        let mut state = state();
        assert_eq!(state.elapsed(), 0);

        advance(&mut state, 3, 10);
        advance(&mut state, 3, 15);

        assert_eq!(state.elapsed(), 25);
        assert_eq!(state.start_time, 1000);
    }

    #[test]
    fn close_all_pops_topmost_first() {
        let mut state = state();
        advance(&mut state, 4, 8);

        let mut events = Vec::new();
        state.close_all(PID, TID, &mut events);

        assert_eq!(events, vec![end(1008); 4]);
        assert!(state.stack.is_empty());
    }

    #[test]
    fn stack_depth_tracks_emitted_events() {
        let mut state = state();
        state.merge_nodes(vec![gc_node(9, 1)]);
        let mut depth: i64 = 0;

        for (sample, delta) in [(4, 1), (9, 1), (5, 1), (6, 2), (6, 1), (9, 1), (4, 1), (1, 1)] {
            for event in advance(&mut state, sample, delta) {
                depth += if event.is_begin() { 1 } else { -1 };
                assert!(depth >= 0);
            }
            assert_eq!(depth as usize, state.stack.len());
            assert_eq!(state.top(), sample);
        }
    }
}
