//! Monte-Carlo tree search over a node arena.
//!
//! Nodes live in a flat `Vec` and refer to each other by index, so the tree
//! has no ownership cycles and advancing the root is a single index write.
//! Values (`w`, `q`) are kept in black's perspective; selection converts to
//! the perspective of the side to move. Virtual losses are tracked per node
//! and counted as settled losses for the player that descended into the
//! node, which keeps parallel descents off in-flight leaves.

use itertools::Itertools;
use rand::distr::weighted::WeightedIndex;
use rand::prelude::*;

use crate::go::symmetry::Symmetry;
use crate::go::{Color, Coord, Position, N, NUM_MOVES};

pub type NodeId = usize;

/// Exploration constant of the PUCT rule.
const PUCT_C: f32 = 2.0;

/// Moves are soft-picked while fewer than this many have been played.
const SOFT_PICK_MOVES: usize = N;

#[derive(Clone, Copy, Debug)]
pub struct MctsTreeOptions {
    /// First-play urgency: an unvisited child starts from the parent's value
    /// shifted against the side to move by this much, clamped to [-1, 1].
    pub value_init_penalty: f32,
    /// Soft-picked visit counts are exponentiated by 1 / this temperature.
    pub policy_softmax_temp: f32,
    pub soft_pick_enabled: bool,
    pub restrict_in_bensons: bool,
}

impl Default for MctsTreeOptions {
    fn default() -> Self {
        MctsTreeOptions {
            value_init_penalty: 2.0,
            policy_softmax_temp: 0.98,
            soft_pick_enabled: true,
            restrict_in_bensons: false,
        }
    }
}

struct Edge {
    coord: Coord,
    prior: f32,
    child: Option<NodeId>,
}

pub struct MctsNode {
    pub position: Position,
    pub parent: Option<NodeId>,
    /// The move that created this node; pass for the initial root.
    pub coord: Coord,
    pub canonical_sym: Symmetry,
    n: u32,
    w: f32,
    vloss: u32,
    expanded: bool,
    edges: Vec<Edge>,
}

fn virtual_loss_value(to_play: Color) -> f32 {
    /* the player that descended into the node is the opponent of the side
     * to move here; a pending read counts as a loss for them */
    match to_play {
        Color::Black => 1.0,
        Color::White => -1.0,
    }
}

impl MctsNode {
    pub fn n(&self) -> u32 {
        self.n
    }

    fn n_in_flight(&self) -> u32 {
        self.n + self.vloss
    }

    pub fn num_virtual_losses(&self) -> u32 {
        self.vloss
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Mean value from black's perspective. In-flight virtual losses pull
    /// the mean toward a loss for the descending player, so a pending
    /// unvisited leaf scores no better than a fresh one.
    pub fn q(&self) -> f32 {
        let w = self.w + self.vloss as f32 * virtual_loss_value(self.position.to_play());
        w / self.n_in_flight().max(1) as f32
    }

    pub fn q_from_side_to_move(&self) -> f32 {
        self.q() * self.position.to_play().sign()
    }

    pub fn game_over(&self) -> bool {
        self.position.is_game_over()
    }

    pub fn at_move_limit(&self) -> bool {
        self.position.at_move_limit()
    }
}

pub struct MctsTree {
    nodes: Vec<MctsNode>,
    root: NodeId,
    options: MctsTreeOptions,
}

impl MctsTree {
    pub fn new(position: Position, options: MctsTreeOptions) -> MctsTree {
        let mut tree = MctsTree {
            nodes: Vec::with_capacity(1024),
            root: 0,
            options,
        };
        tree.add_node(position, None, Coord::PASS);
        tree
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root(&self) -> &MctsNode {
        &self.nodes[self.root]
    }

    pub fn node(&self, id: NodeId) -> &MctsNode {
        &self.nodes[id]
    }

    pub fn to_play(&self) -> Color {
        self.root().position.to_play()
    }

    pub fn is_game_over(&self) -> bool {
        self.root().game_over()
    }

    pub fn at_move_limit(&self) -> bool {
        self.root().at_move_limit()
    }

    pub fn calculate_score(&self, komi: f32) -> f32 {
        self.root().position.score(komi)
    }

    /// Descends under the PUCT policy to a leaf. Returns `None` when the
    /// descent lands on a leaf that already has an inference in flight.
    pub fn select_leaf(&mut self, allow_pass: bool) -> Option<NodeId> {
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            if node.game_over() || node.at_move_limit() {
                return Some(id);
            }
            if !node.expanded {
                return if node.vloss > 0 { None } else { Some(id) };
            }
            let edge_idx = self.best_edge(id, allow_pass);
            id = self.ensure_child(id, edge_idx);
        }
    }

    /// Expands `leaf` with priors over its legal moves and backs the value
    /// up to the root. Incorporating into an already-expanded node only
    /// backs up.
    pub fn incorporate_results(&mut self, leaf: NodeId, policy: &[f32; NUM_MOVES], value: f32) {
        let node = &self.nodes[leaf];
        if !node.expanded && !node.game_over() && !node.at_move_limit() {
            let legal = node.position.legal_moves(self.options.restrict_in_bensons);
            let total: f32 = legal.iter().map(|c| policy[c.index()].max(0.0)).sum();
            let uniform = 1.0 / legal.len() as f32;
            let edges = legal
                .into_iter()
                .map(|coord| Edge {
                    coord,
                    prior: if total > 0.0 {
                        policy[coord.index()].max(0.0) / total
                    } else {
                        uniform
                    },
                    child: None,
                })
                .collect();
            let node = &mut self.nodes[leaf];
            node.edges = edges;
            node.expanded = true;
        }
        self.backup(leaf, value);
    }

    /// Backs up a terminal result without expanding.
    pub fn incorporate_end_game_result(&mut self, leaf: NodeId, value: f32) {
        self.backup(leaf, value);
    }

    pub fn add_virtual_loss(&mut self, leaf: NodeId) {
        let mut id = leaf;
        loop {
            self.nodes[id].vloss += 1;
            if id == self.root {
                return;
            }
            id = self.nodes[id].parent.unwrap();
        }
    }

    pub fn revert_virtual_loss(&mut self, leaf: NodeId) {
        let mut id = leaf;
        loop {
            debug_assert!(self.nodes[id].vloss > 0);
            self.nodes[id].vloss -= 1;
            if id == self.root {
                return;
            }
            id = self.nodes[id].parent.unwrap();
        }
    }

    /// Blends `noise` into the root priors. A no-op before the root has
    /// been expanded.
    pub fn inject_noise(&mut self, noise: &[f32; NUM_MOVES], mix: f32) {
        let root = self.root;
        if !self.nodes[root].expanded {
            return;
        }
        for edge in &mut self.nodes[root].edges {
            edge.prior = (1.0 - mix) * edge.prior + mix * noise[edge.coord.index()];
        }
    }

    /// Picks the move to play: sampled proportionally to
    /// `N^(1/policy_softmax_temp)` for the first few moves, the most
    /// visited child afterwards.
    pub fn pick_move(&self, rng: &mut StdRng) -> Coord {
        let root = self.root();
        assert!(root.expanded, "pick_move requires an expanded root");
        let visits = root
            .edges
            .iter()
            .map(|e| e.child.map_or(0, |c| self.nodes[c].n))
            .collect_vec();

        if self.options.soft_pick_enabled && root.position.n() < SOFT_PICK_MOVES {
            let weights = visits
                .iter()
                .map(|&n| (n as f32).powf(1.0 / self.options.policy_softmax_temp))
                .collect_vec();
            if weights.iter().sum::<f32>() > 0.0 {
                let dist = WeightedIndex::new(&weights).unwrap();
                return root.edges[dist.sample(rng)].coord;
            }
        }
        let best = visits.iter().position_max().unwrap();
        root.edges[best].coord
    }

    /// The visit-count policy target over all moves.
    pub fn calculate_search_pi(&self) -> Box<[f32; NUM_MOVES]> {
        let root = self.root();
        let mut pi = Box::new([0.0f32; NUM_MOVES]);
        let total: u32 = root
            .edges
            .iter()
            .map(|e| e.child.map_or(0, |c| self.nodes[c].n))
            .sum();
        if total == 0 {
            let uniform = 1.0 / root.edges.len().max(1) as f32;
            for edge in &root.edges {
                pi[edge.coord.index()] = uniform;
            }
        } else {
            for edge in &root.edges {
                let n = edge.child.map_or(0, |c| self.nodes[c].n);
                pi[edge.coord.index()] = n as f32 / total as f32;
            }
        }
        pi
    }

    /// Target pruning: subtracts visits from every non-best child until its
    /// action score no longer beats the played move's.
    pub fn reshape_final_visits(&mut self) {
        let root_id = self.root;
        let root_n = self.nodes[root_id].n;
        let to_play = self.nodes[root_id].position.to_play();
        let u_common = PUCT_C * ((1 + root_n) as f32).sqrt();

        let child_stats = |tree: &MctsTree, edge: &Edge| -> (u32, f32) {
            match edge.child {
                Some(c) => (tree.nodes[c].n, tree.nodes[c].q() * to_play.sign()),
                None => (0, 0.0),
            }
        };

        let best = match (0..self.nodes[root_id].edges.len())
            .max_by_key(|&i| child_stats(self, &self.nodes[root_id].edges[i]).0)
        {
            Some(best) => best,
            None => return,
        };
        let (best_n, best_q) = child_stats(self, &self.nodes[root_id].edges[best]);
        if best_n == 0 {
            return;
        }
        let best_prior = self.nodes[root_id].edges[best].prior;
        let best_score = best_q + u_common * best_prior / (1 + best_n) as f32;

        for i in 0..self.nodes[root_id].edges.len() {
            if i == best {
                continue;
            }
            let child = match self.nodes[root_id].edges[i].child {
                Some(c) => c,
                None => continue,
            };
            let (n, q) = child_stats(self, &self.nodes[root_id].edges[i]);
            if n == 0 {
                continue;
            }
            let headroom = best_score - q;
            if headroom <= 0.0 {
                continue;
            }
            /* the largest visit count at which this child's Q + U still
             * reaches the played move's score */
            let prior = self.nodes[root_id].edges[i].prior;
            let allowed = (u_common * prior / headroom - 1.0).floor().max(0.0) as u32;
            self.nodes[child].n = n.min(allowed);
        }
    }

    /// Advances the root to the chosen child. Nodes above the new root are
    /// kept so feature encoding can walk the true position history.
    pub fn play_move(&mut self, c: Coord) {
        let root = self.root;
        assert!(self.nodes[root].expanded, "cannot play from an unexpanded root");
        let edge_idx = self.nodes[root]
            .edges
            .iter()
            .position(|e| e.coord == c)
            .expect("played move must be legal");
        self.root = self.ensure_child(root, edge_idx);
    }

    /// Drops everything below the root but keeps the root's own statistics,
    /// so read budgets anchored at `root.N()` stay meaningful.
    pub fn clear_subtrees(&mut self) {
        let root = &mut self.nodes[self.root];
        root.edges.clear();
        root.expanded = false;
    }

    /// The positions leading to `leaf`, most recent first, at most `cap`.
    pub fn position_history(&self, leaf: NodeId, cap: usize) -> Vec<Position> {
        let mut history = Vec::with_capacity(cap);
        let mut id = Some(leaf);
        while let Some(node_id) = id {
            if history.len() == cap {
                break;
            }
            let node = &self.nodes[node_id];
            history.push(node.position);
            id = node.parent;
        }
        history
    }

    /// A short human-readable summary of the root and its top children.
    pub fn describe(&self) -> String {
        let root = self.root();
        let mut lines = vec![format!(
            "N: {}  Q: {:.5}  to play: {}",
            root.n,
            root.q(),
            root.position.to_play()
        )];
        let mut children = root
            .edges
            .iter()
            .filter_map(|e| e.child.map(|c| (e.coord, e.prior, &self.nodes[c])))
            .collect_vec();
        children.sort_by_key(|(_, _, node)| std::cmp::Reverse(node.n));
        for (coord, prior, node) in children.into_iter().take(10) {
            lines.push(format!(
                "  {coord:>4}  N: {:>5}  Q: {:>8.5}  P: {:.3}",
                node.n,
                node.q(),
                prior
            ));
        }
        lines.join("\n")
    }

    fn add_node(&mut self, position: Position, parent: Option<NodeId>, coord: Coord) -> NodeId {
        let canonical_sym = position.canonical_symmetry();
        let id = self.nodes.len();
        self.nodes.push(MctsNode {
            position,
            parent,
            coord,
            canonical_sym,
            n: 0,
            w: 0.0,
            vloss: 0,
            expanded: false,
            edges: Vec::new(),
        });
        id
    }

    fn ensure_child(&mut self, id: NodeId, edge_idx: usize) -> NodeId {
        if let Some(child) = self.nodes[id].edges[edge_idx].child {
            return child;
        }
        let coord = self.nodes[id].edges[edge_idx].coord;
        let position = self.nodes[id].position.play(coord);
        let child = self.add_node(position, Some(id), coord);
        self.nodes[id].edges[edge_idx].child = Some(child);
        child
    }

    fn best_edge(&self, id: NodeId, allow_pass: bool) -> usize {
        let node = &self.nodes[id];
        let to_play = node.position.to_play();
        let parent_q = node.q();
        let first_play_q =
            (parent_q - self.options.value_init_penalty * to_play.sign()).clamp(-1.0, 1.0);
        let sqrt_n = ((1 + node.n_in_flight()) as f32).sqrt();

        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, edge) in node.edges.iter().enumerate() {
            if !allow_pass && edge.coord.is_pass() && node.edges.len() > 1 {
                continue;
            }
            let (child_n, child_q) = match edge.child {
                Some(c) if self.nodes[c].n_in_flight() > 0 => {
                    (self.nodes[c].n_in_flight(), self.nodes[c].q())
                }
                _ => (0, first_play_q),
            };
            let q_persp = child_q * to_play.sign();
            let u = PUCT_C * edge.prior * sqrt_n / (1 + child_n) as f32;
            let score = q_persp + u;
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        best
    }

    fn backup(&mut self, leaf: NodeId, value: f32) {
        let mut id = leaf;
        loop {
            let node = &mut self.nodes[id];
            node.n += 1;
            node.w += value;
            let parent = node.parent;
            if id == self.root {
                return;
            }
            id = parent.unwrap();
        }
    }
}
