// src/core/storage/dict/entry.rs

//! Bucket chain nodes and the forward-node value cell.

/// A singly linked bucket chain, most recently inserted entry first.
pub(super) type Link<K, V> = Option<Box<Entry<K, V>>>;

#[derive(Debug)]
pub(super) struct Entry<K, V> {
    /// Cached mixed hash; compared before the full key to short-circuit scans.
    pub hash: u32,
    pub key: K,
    pub cell: ValueCell<V>,
    pub next: Link<K, V>,
}

/// The value slot of an entry.
///
/// Outside of a snapshot every entry is `Live`. While a snapshot is active,
/// the first write to a key converts its cell into a `Forward` node that
/// carries both sides; `finish_snapshot` collapses it back.
#[derive(Debug)]
pub(super) enum ValueCell<V> {
    Live(V),
    Forward(ForwardNode<V>),
}

/// A two-cell record holding the snapshot-time value and the live value.
/// `None` on either side acts as a tombstone: the key did not exist in that
/// view.
#[derive(Debug)]
pub(super) struct ForwardNode<V> {
    pub snapshot: Option<V>,
    pub live: Option<V>,
    pub op: ForwardOp,
}

/// The kind of divergence a forward node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOp {
    Insert,
    Update,
    Remove,
}

impl<V> ValueCell<V> {
    /// The value the live view sees, if any.
    pub fn live(&self) -> Option<&V> {
        match self {
            ValueCell::Live(v) => Some(v),
            ValueCell::Forward(f) => f.live.as_ref(),
        }
    }

    pub fn live_mut(&mut self) -> Option<&mut V> {
        match self {
            ValueCell::Live(v) => Some(v),
            ValueCell::Forward(f) => f.live.as_mut(),
        }
    }

    /// The value the snapshot view sees, if any. A plain `Live` cell means
    /// the entry has not diverged since `start_snapshot`, so both views
    /// share the same value.
    pub fn snapshot_view(&self) -> Option<&V> {
        match self {
            ValueCell::Live(v) => Some(v),
            ValueCell::Forward(f) => f.snapshot.as_ref(),
        }
    }

}

/// Finds the entry for `key` in a chain.
pub(super) fn find<'a, K: PartialEq, V>(
    mut link: &'a Link<K, V>,
    hash: u32,
    key: &K,
) -> Option<&'a Entry<K, V>> {
    while let Some(entry) = link {
        if entry.hash == hash && entry.key == *key {
            return Some(entry);
        }
        link = &entry.next;
    }
    None
}

/// Finds the entry for `key` in a chain, mutably. Chains stay short because
/// the load factor is bounded.
pub(super) fn find_mut<'a, K: PartialEq, V>(
    mut link: &'a mut Link<K, V>,
    hash: u32,
    key: &K,
) -> Option<&'a mut Entry<K, V>> {
    while let Some(entry) = link {
        if entry.hash == hash && entry.key == *key {
            return Some(entry);
        }
        link = &mut entry.next;
    }
    None
}

/// Unlinks and returns the entry for `key`, keeping the relative order of
/// the remaining chain intact.
pub(super) fn unlink<K: PartialEq, V>(
    bucket: &mut Link<K, V>,
    hash: u32,
    key: &K,
) -> Option<Box<Entry<K, V>>> {
    let mut head = bucket.take();
    let mut removed = None;
    let mut reversed: Link<K, V> = None;

    while let Some(mut node) = head {
        head = node.next.take();
        if removed.is_none() && node.hash == hash && node.key == *key {
            removed = Some(node);
        } else {
            node.next = reversed;
            reversed = Some(node);
        }
    }

    // The survivors were collected in reverse; relink them in the
    // original order.
    while let Some(mut node) = reversed {
        reversed = node.next.take();
        node.next = bucket.take();
        *bucket = Some(node);
    }

    removed
}
