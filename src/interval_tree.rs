//! AVL tree of closed integer intervals for order-statistic queries.
//!
//! The tree stores a set of `u64` indices, presented one at a time;
//! adjacent indices collapse into a single closed interval `[k1, k2]`.
//! Every node additionally stores `v`, the number of indices in its
//! **left** subtree, which makes "how many stored indices are below x"
//! an O(log n) descent.
//!
//! The quality evaluator replays deletions against a sequential reference
//! with these trees: element numbering is dense, so runs of consumed
//! elements collapse into a handful of intervals.
//!
//! Indices are numbered from 1. [`IntervalTree::nth_untaken_ix`] never
//! reports index 0.

use thiserror::Error;

/// Inserting an index that is already present. This is a programming error
/// in the caller (the replay engine feeds each element exactly once).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("index {0} is already in the tree")]
pub struct DuplicateIndex(pub u64);

type Link = Option<Box<Node>>;

#[derive(Debug, Clone)]
struct Node {
    l: Link,
    r: Link,
    /// The key interval `[k1, k2]`, inclusive on both ends.
    k1: u64,
    k2: u64,
    /// Number of indices stored in the left subtree.
    v: u64,
    /// Height; a node without children has height 0.
    h: i8,
}

impl Node {
    fn boxed(index: u64) -> Box<Self> {
        Box::new(Self {
            l: None,
            r: None,
            k1: index,
            k2: index,
            v: 0,
            h: 0,
        })
    }

    fn len(&self) -> u64 {
        self.k2 - self.k1 + 1
    }
}

fn height(link: &Link) -> i8 {
    link.as_ref().map_or(-1, |n| n.h)
}

fn set_height(node: &mut Node) {
    node.h = height(&node.l).max(height(&node.r)) + 1;
}

/// Indices stored in the subtree. Walks the right spine, O(log n).
fn subtree_count(link: &Link) -> u64 {
    match link {
        None => 0,
        Some(n) => n.len() + n.v + subtree_count(&n.r),
    }
}

fn rotate_left(link: &mut Link) {
    let mut x: Box<Node> = link.take().expect("rotate_left on empty link");
    let mut r: Box<Node> = x.r.take().expect("rotate_left without right child");
    x.r = r.l.take();
    // x and its left subtree move below r.
    r.v += x.v + x.len();
    set_height(&mut x);
    r.l = Some(x);
    set_height(&mut r);
    *link = Some(r);
}

fn rotate_right(link: &mut Link) {
    let mut x: Box<Node> = link.take().expect("rotate_right on empty link");
    let mut l: Box<Node> = x.l.take().expect("rotate_right without left child");
    x.l = l.r.take();
    // x keeps only l's old right subtree on its left.
    x.v = subtree_count(&x.l);
    set_height(&mut x);
    l.r = Some(x);
    set_height(&mut l);
    *link = Some(l);
}

fn rebalance(link: &mut Link) {
    let node: &mut Node = link.as_mut().expect("rebalance on empty link");
    let lh: i8 = height(&node.l);
    let rh: i8 = height(&node.r);

    if (lh - rh).abs() < 2 {
        set_height(node);
        return;
    }

    if lh < rh {
        let r: &mut Node = node.r.as_mut().expect("right-heavy without right child");
        if height(&r.l) > height(&r.r) {
            rotate_right(&mut node.r);
        }
        rotate_left(link);
    } else {
        let l: &mut Node = node.l.as_mut().expect("left-heavy without left child");
        if height(&l.r) > height(&l.l) {
            rotate_left(&mut node.l);
        }
        rotate_right(link);
    }
}

/// What happened below the current frame during an insert descent.
enum Outcome {
    /// A new single-index node was created.
    Added,
    /// The index will be absorbed by the first adjacent ancestor (upper).
    ExtendPending,
    /// Both adjacent ancestors exist; the second one (lower) is the parent
    /// of the empty slot and must splice itself out.
    MergeFromLeaf,
    /// The lower node has been spliced; its interval travels up until the
    /// upper node absorbs it together with the index.
    MergeUp { k1: u64, k2: u64 },
    /// The index (and any merged interval) is accounted for inside an
    /// ancestor's own interval.
    Absorbed,
}

fn insert_rec(link: &mut Link, index: u64, seen: u8) -> Result<Outcome, DuplicateIndex> {
    if link.is_none() {
        return Ok(match seen {
            0 => {
                *link = Some(Node::boxed(index));
                Outcome::Added
            }
            1 => Outcome::ExtendPending,
            _ => Outcome::MergeFromLeaf,
        });
    }

    let node: &mut Node = link.as_mut().expect("checked non-empty");
    if index >= node.k1 && index <= node.k2 {
        return Err(DuplicateIndex(index));
    }

    // First adjacent node on the path is the upper (role 1), the second the
    // lower (role 2).
    let adjacent: bool = node.k2 + 1 == index || index + 1 == node.k1;
    let role: u8 = if adjacent { seen + 1 } else { 0 };
    let child_seen: u8 = if adjacent { seen + 1 } else { seen };

    let went_left: bool = index < node.k1;
    let child: &mut Link = if went_left { &mut node.l } else { &mut node.r };
    let outcome: Outcome = insert_rec(child, index, child_seen)?;

    let result: Outcome = match outcome {
        Outcome::Added => {
            if went_left {
                node.v += 1;
            }
            Outcome::Added
        }
        Outcome::ExtendPending => {
            if role == 1 {
                if went_left {
                    node.k1 = index;
                } else {
                    node.k2 = index;
                }
                Outcome::Absorbed
            } else {
                Outcome::ExtendPending
            }
        }
        Outcome::MergeFromLeaf => {
            debug_assert_eq!(role, 2, "only the lower node sees the merge leaf");
            let (k1, k2) = (node.k1, node.k2);
            // The descent side is empty, so the far-side child replaces us.
            let keep: Link = if went_left {
                debug_assert!(node.l.is_none());
                node.r.take()
            } else {
                debug_assert!(node.r.is_none());
                node.l.take()
            };
            *link = keep;
            // No rebalance here: this frame's node is gone; ancestors
            // rebalance on unwind.
            return Ok(Outcome::MergeUp { k1, k2 });
        }
        Outcome::MergeUp { k1, k2 } => {
            let merged_len: u64 = k2 - k1 + 1;
            if went_left {
                node.v -= merged_len;
            }
            if role == 1 {
                if went_left {
                    node.k1 = k1;
                } else {
                    node.k2 = k2;
                }
                Outcome::Absorbed
            } else {
                Outcome::MergeUp { k1, k2 }
            }
        }
        Outcome::Absorbed => {
            if went_left {
                node.v += 1;
            }
            Outcome::Absorbed
        }
    };

    rebalance(link);
    Ok(result)
}

/// AVL tree of disjoint, non-adjacent closed intervals with left-subtree
/// index counts. Assignment is by [`Clone`], which deep-copies the nodes.
#[derive(Debug, Clone, Default)]
pub struct IntervalTree {
    root: Link,
    total: u64,
}

impl IntervalTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: None,
            total: 0,
        }
    }

    /// Number of indices stored.
    #[must_use]
    pub fn total_taken(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Insert a single index, collapsing it into adjacent intervals.
    ///
    /// # Errors
    /// [`DuplicateIndex`] if the index is already stored.
    pub fn insert(&mut self, index: u64) -> Result<(), DuplicateIndex> {
        insert_rec(&mut self.root, index, 0)?;
        self.total += 1;
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        let mut cur: &Link = &self.root;
        while let Some(node) = cur {
            if index < node.k1 {
                cur = &node.l;
            } else if index > node.k2 {
                cur = &node.r;
            } else {
                return true;
            }
        }
        false
    }

    /// Number of stored indices strictly below `index`.
    #[must_use]
    pub fn taken_before(&self, index: u64) -> u64 {
        let mut acc: u64 = 0;
        let mut cur: &Link = &self.root;
        while let Some(node) = cur {
            if index <= node.k1 {
                cur = &node.l;
            } else if index > node.k2 {
                acc += node.v + node.len();
                cur = &node.r;
            } else {
                return acc + node.v + (index - node.k1);
            }
        }
        acc
    }

    /// Number of indices in `[0, index)` that are NOT stored.
    #[must_use]
    pub fn num_untaken_before(&self, index: u64) -> u64 {
        index - self.taken_before(index)
    }

    /// The `n`-th (0-based) index `>= 1` that is not stored.
    #[must_use]
    pub fn nth_untaken_ix(&self, n: u64) -> u64 {
        Self::nth_rec(&self.root, n, 0).unwrap_or(n + 1)
    }

    fn nth_rec(link: &Link, n: u64, taken_above: u64) -> Option<u64> {
        let node: &Node = link.as_deref()?;
        debug_assert!(node.k1 >= 1 + taken_above + node.v, "indices start at 1");

        // Untaken indices in [1, k1).
        let untaken_left: u64 = node.k1 - 1 - taken_above - node.v;

        if untaken_left == n {
            // Exactly n untaken below this interval; k2 + 1 is free because
            // intervals are never adjacent.
            Some(node.k2 + 1)
        } else if untaken_left < n {
            match Self::nth_rec(&node.r, n, taken_above + node.v + node.len()) {
                Some(ix) => Some(ix),
                // Right subtree cannot place it: the answer lies in the
                // unbroken run above k2.
                None => Some(node.k2 + 1 + (n - untaken_left)),
            }
        } else {
            Self::nth_rec(&node.l, n, taken_above)
        }
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.total = 0;
    }

    /// In-order list of stored intervals. Intended for inspection and
    /// tests.
    #[must_use]
    pub fn intervals(&self) -> Vec<(u64, u64)> {
        fn walk(link: &Link, out: &mut Vec<(u64, u64)>) {
            if let Some(node) = link {
                walk(&node.l, out);
                out.push((node.k1, node.k2));
                walk(&node.r, out);
            }
        }
        let mut out: Vec<(u64, u64)> = Vec::new();
        walk(&self.root, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Recursively verify AVL balance, heights, and `v` counters.
    fn check_structure(link: &Link) -> (i8, u64) {
        match link {
            None => (-1, 0),
            Some(node) => {
                let (lh, lc) = check_structure(&node.l);
                let (rh, rc) = check_structure(&node.r);
                assert!((lh - rh).abs() <= 1, "AVL balance violated");
                assert_eq!(node.h, lh.max(rh) + 1, "stale height");
                assert_eq!(node.v, lc, "left-subtree count out of sync");
                (node.h, lc + node.len() + rc)
            }
        }
    }

    fn check_invariants(tree: &IntervalTree) {
        let (_, count) = check_structure(&tree.root);
        assert_eq!(count, tree.total_taken());

        let intervals = tree.intervals();
        for w in intervals.windows(2) {
            assert!(
                w[0].1 + 1 < w[1].0,
                "intervals must be disjoint and non-adjacent: {intervals:?}"
            );
        }
    }

    #[test]
    fn adjacent_inserts_collapse_to_one_interval() {
        let mut tree = IntervalTree::new();
        tree.insert(1).unwrap();
        tree.insert(3).unwrap();
        tree.insert(2).unwrap();

        assert_eq!(tree.intervals(), vec![(1, 3)]);
        assert_eq!(tree.total_taken(), 3);
        assert_eq!(tree.num_untaken_before(10), 7);
        check_invariants(&tree);
    }

    #[test]
    fn sequential_inserts_stay_single_node() {
        let mut tree = IntervalTree::new();
        for i in 1..=15u64 {
            tree.insert(i).unwrap();
        }
        assert_eq!(tree.intervals(), vec![(1, 15)]);
        check_invariants(&tree);

        tree.insert(17).unwrap();
        tree.insert(19).unwrap();
        tree.insert(21).unwrap();

        assert_eq!(
            tree.intervals(),
            vec![(1, 15), (17, 17), (19, 19), (21, 21)]
        );
        check_invariants(&tree);
        assert_eq!(tree.nth_untaken_ix(0), 16);
        assert_eq!(tree.nth_untaken_ix(1), 18);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = IntervalTree::new();
        tree.insert(4).unwrap();
        tree.insert(5).unwrap();
        assert_eq!(tree.insert(4), Err(DuplicateIndex(4)));
        assert_eq!(tree.total_taken(), 2);
    }

    #[test]
    fn gap_fill_merges_two_intervals() {
        let mut tree = IntervalTree::new();
        for i in [1u64, 2, 5, 6, 9, 10] {
            tree.insert(i).unwrap();
        }
        check_invariants(&tree);

        tree.insert(4).unwrap();
        check_invariants(&tree);
        assert_eq!(tree.intervals(), vec![(1, 2), (4, 6), (9, 10)]);

        tree.insert(3).unwrap();
        check_invariants(&tree);
        assert_eq!(tree.intervals(), vec![(1, 6), (9, 10)]);
    }

    #[test]
    fn taken_before_counts_partial_intervals() {
        let mut tree = IntervalTree::new();
        for i in [2u64, 3, 4, 8, 9] {
            tree.insert(i).unwrap();
        }
        assert_eq!(tree.taken_before(1), 0);
        assert_eq!(tree.taken_before(3), 1);
        assert_eq!(tree.taken_before(5), 3);
        assert_eq!(tree.taken_before(9), 4);
        assert_eq!(tree.taken_before(100), 5);
    }

    #[test]
    fn nth_untaken_on_empty_tree() {
        let tree = IntervalTree::new();
        assert_eq!(tree.nth_untaken_ix(0), 1);
        assert_eq!(tree.nth_untaken_ix(6), 7);
    }

    #[test]
    fn untaken_round_trip() {
        let mut tree = IntervalTree::new();
        for i in [1u64, 2, 3, 7, 8, 12] {
            tree.insert(i).unwrap();
        }
        for x in 1..=20u64 {
            if tree.contains(x) {
                continue;
            }
            let n = tree.num_untaken_before(x) - 1;
            assert_eq!(tree.nth_untaken_ix(n), x, "round trip failed at {x}");
        }
    }

    #[test]
    fn clone_is_independent() {
        let mut tree = IntervalTree::new();
        tree.insert(5).unwrap();
        let snapshot = tree.clone();
        tree.insert(6).unwrap();

        assert_eq!(snapshot.total_taken(), 1);
        assert_eq!(tree.total_taken(), 2);
    }

    #[test]
    fn clear_empties_the_tree() {
        let mut tree = IntervalTree::new();
        for i in 1..=8u64 {
            tree.insert(i).unwrap();
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.total_taken(), 0);
        assert_eq!(tree.nth_untaken_ix(0), 1);
    }

    proptest! {
        #[test]
        fn random_inserts_preserve_invariants(
            indices in proptest::collection::hash_set(1..500u64, 1..120)
        ) {
            let mut tree = IntervalTree::new();
            for &ix in &indices {
                tree.insert(ix).unwrap();
            }
            check_invariants(&tree);
            prop_assert_eq!(tree.total_taken(), indices.len() as u64);

            // Count conservation at any probe point above the maximum.
            let probe: u64 = 1000;
            prop_assert_eq!(
                tree.num_untaken_before(probe) + tree.taken_before(probe),
                probe
            );
        }

        #[test]
        fn random_round_trip(
            indices in proptest::collection::hash_set(1..200u64, 1..60),
            probe in 1..250u64
        ) {
            let mut tree = IntervalTree::new();
            for &ix in &indices {
                tree.insert(ix).unwrap();
            }
            if !tree.contains(probe) {
                let n = tree.num_untaken_before(probe) - 1;
                prop_assert_eq!(tree.nth_untaken_ix(n), probe);
            }
        }

        #[test]
        fn taken_before_matches_naive_count(
            indices in proptest::collection::hash_set(1..300u64, 1..80),
            probe in 0..350u64
        ) {
            let mut tree = IntervalTree::new();
            for &ix in &indices {
                tree.insert(ix).unwrap();
            }
            let naive: u64 = indices.iter().filter(|&&ix| ix < probe).count() as u64;
            prop_assert_eq!(tree.taken_before(probe), naive);
        }
    }
}
