//! Token pool bookkeeping shared by [`crate::Server`] and [`crate::Proxy`].
//!
//! This is deliberately split out from the event loop: it owns only the
//! ledger (free ids, who holds what) and the invariants over it, so they can
//! be property-tested in isolation from any pipe I/O.

use std::collections::{HashMap, VecDeque};

/// An internal token id. Distinct from the byte that travels the wire; see
/// [`crate::client::Acquired`] for the wire-level byte.
pub type Token = u32;

/// Stable identifier for a child registration: the numeric fd of its return
/// pipe on unix.
#[cfg(unix)]
pub type ChildId = std::os::unix::io::RawFd;

/// The free/assigned ledger for a fixed or growable set of token ids.
///
/// Invariants, checked with `debug_assert!` at every mutation: `free` and
/// the union of all `child_tokens` values partition `[0, next_unused)`
/// disjointly, and `token_owner` agrees with `child_tokens` in both
/// directions.
#[derive(Debug, Default)]
pub struct Pool {
    free: VecDeque<Token>,
    token_owner: HashMap<Token, ChildId>,
    child_tokens: HashMap<ChildId, Vec<Token>>,
}

impl Pool {
    /// Build a pool pre-seeded with ids `0..n`, all free.
    pub fn with_capacity(n: u32) -> Self {
        Self {
            free: (0..n).collect(),
            token_owner: HashMap::new(),
            child_tokens: HashMap::new(),
        }
    }

    /// Register a new, token-less child.
    pub fn add_child(&mut self, child: ChildId) {
        self.child_tokens.insert(child, Vec::new());
    }

    /// Remove a child's bookkeeping entirely. Panics (via `debug_assert`) if
    /// the child still holds tokens and `allow_held_tokens` is false; in
    /// that case the caller is expected to have already force-reclaimed them
    /// with [`Pool::force_reclaim_all`].
    pub fn remove_child(&mut self, child: ChildId) {
        debug_assert!(
            self.child_tokens.get(&child).map_or(true, |v| v.is_empty()),
            "removing child {child:?} that still holds tokens"
        );
        self.child_tokens.remove(&child);
    }

    /// Number of tokens sitting in the free pool.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Tokens currently held by `child`, in FIFO (oldest-granted-first)
    /// order.
    pub fn tokens_of(&self, child: ChildId) -> &[Token] {
        self.child_tokens
            .get(&child)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The lowest free token id, without assigning it. Deterministic
    /// tie-break, kept for reproducible traces.
    pub fn peek_next_free(&self) -> Option<Token> {
        self.free.front().copied()
    }

    /// Insert a freshly-minted token id directly into the free pool (used by
    /// [`crate::Proxy`] when it grows the pool from its upstream client).
    /// The caller is responsible for ensuring `token` is not already known
    /// to this pool.
    pub fn admit_free(&mut self, token: Token) {
        debug_assert!(
            !self.token_owner.contains_key(&token) && !self.free.contains(&token),
            "admitting token {token} that the pool already knows about"
        );
        insert_sorted(&mut self.free, token);
    }

    /// Assign the lowest free token to `child`. Returns `None` if the pool
    /// is empty.
    pub fn assign_next(&mut self, child: ChildId) -> Option<Token> {
        let token = self.free.pop_front()?;
        self.assign(child, token);
        Some(token)
    }

    fn assign(&mut self, child: ChildId, token: Token) {
        debug_assert!(
            !self.token_owner.contains_key(&token),
            "token {token} assigned twice"
        );
        self.token_owner.insert(token, child);
        self.child_tokens.entry(child).or_default().push(token);
    }

    /// Reclaim the oldest token held by `child` (FIFO), moving it back to
    /// the free pool. Panics (via `debug_assert`) if `child` holds no
    /// tokens.
    pub fn unassign_oldest(&mut self, child: ChildId) -> Token {
        let tokens = self
            .child_tokens
            .get_mut(&child)
            .expect("unassign on unknown child");
        debug_assert!(!tokens.is_empty(), "unassign on child with no tokens");
        let token = tokens.remove(0);
        self.unassign(child, token);
        token
    }

    fn unassign(&mut self, child: ChildId, token: Token) {
        let owner = self.token_owner.remove(&token);
        debug_assert_eq!(owner, Some(child), "token {token} unassigned by the wrong child");
        insert_sorted(&mut self.free, token);
    }

    /// Forcibly reclaim every token still held by `child` (used at cleanup
    /// when `allow_held_tokens` is set). Returns how many were reclaimed.
    pub fn force_reclaim_all(&mut self, child: ChildId) -> usize {
        let tokens = self.child_tokens.get(&child).cloned().unwrap_or_default();
        for token in &tokens {
            self.token_owner.remove(token);
            insert_sorted(&mut self.free, *token);
        }
        if let Some(entry) = self.child_tokens.get_mut(&child) {
            entry.clear();
        }
        tokens.len()
    }

    /// Undo an `assign_next` that could not actually be delivered (e.g. the
    /// grant write failed with `EPIPE`). `token` is removed from `child`'s
    /// record by value rather than by position, since it was just pushed
    /// onto the back rather than the front.
    pub fn rollback_assign(&mut self, child: ChildId, token: Token) {
        if let Some(tokens) = self.child_tokens.get_mut(&child) {
            if let Some(pos) = tokens.iter().position(|&t| t == token) {
                tokens.remove(pos);
            }
        }
        self.unassign(child, token);
    }

    /// Remove and return up to `n` free tokens, in ascending order. Used by
    /// [`crate::Proxy`] to shrink its pool back down to the upstream.
    pub fn take_free(&mut self, n: usize) -> Vec<Token> {
        let n = n.min(self.free.len());
        self.free.drain(..n).collect()
    }

    #[cfg(test)]
    pub fn assert_invariants(&self, universe: u32) {
        let mut seen: Vec<Token> = self.free.iter().copied().collect();
        for tokens in self.child_tokens.values() {
            seen.extend(tokens.iter().copied());
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), (0..universe).len(), "tokens partition [0, N)");

        for (token, child) in &self.token_owner {
            assert!(self.child_tokens[child].contains(token));
        }
        for (child, tokens) in &self.child_tokens {
            for token in tokens {
                assert_eq!(self.token_owner.get(token), Some(child));
            }
        }
    }
}

fn insert_sorted(free: &mut VecDeque<Token>, token: Token) {
    let pos = free.iter().position(|&t| t > token).unwrap_or(free.len());
    free.insert(pos, token);
}
