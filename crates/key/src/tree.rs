//! Prefix tree keyed by ordered path segments.

use indexmap::IndexMap;

/// A node in a prefix tree mapping a path of string segments to a single `V`.
///
/// Children keep insertion order, so iteration is deterministic. Hierarchical
/// keys such as `["users"]`, `["users", 1]` and `["users", 1, "posts"]` share
/// a branch, which turns "everything under `["users"]`" into a subtree walk
/// instead of a full scan.
///
/// ```
/// use stash_key::TreeMapNode;
///
/// let mut tree = TreeMapNode::new();
/// tree.set(&["a", "b", "c"], 1);
/// tree.set(&["a", "b", "d"], 2);
/// let branch = tree.find(&["a", "b"]).unwrap();
/// assert!(branch.value().is_none());
/// assert_eq!(branch.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct TreeMapNode<V> {
    value: Option<V>,
    children: Option<IndexMap<String, TreeMapNode<V>>>,
}

impl<V> Default for TreeMapNode<V> {
    fn default() -> Self {
        Self { value: None, children: None }
    }
}

impl<V> TreeMapNode<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Direct children in insertion order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &TreeMapNode<V>)> {
        self.children.iter().flat_map(|c| c.iter()).map(|(k, v)| (k.as_str(), v))
    }

    /// Set `value` at `path`, creating intermediate nodes as needed. Returns
    /// the value previously stored there, if any.
    pub fn set<S: AsRef<str>>(&mut self, path: &[S], value: V) -> Option<V> {
        let mut node = self;
        for segment in path {
            let children = node.children.get_or_insert_with(IndexMap::new);
            node = children.entry(segment.as_ref().to_owned()).or_default();
        }
        node.value.replace(value)
    }

    /// Value stored exactly at `path`.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&V> {
        self.find(path).and_then(|node| node.value.as_ref())
    }

    /// The node exactly at `path`, whether or not it holds a value.
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<&TreeMapNode<V>> {
        let mut node = self;
        for segment in path {
            node = node.children.as_ref()?.get(segment.as_ref())?;
        }
        Some(node)
    }

    fn find_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Option<&mut TreeMapNode<V>> {
        let mut node = self;
        for segment in path {
            node = node.children.as_mut()?.get_mut(segment.as_ref())?;
        }
        Some(node)
    }

    /// Remove the node at `path` together with its whole subtree.
    ///
    /// Ancestors left without values or children are not pruned; use
    /// [`is_empty`](Self::is_empty) to detect them. Deleting the empty path
    /// is a no-op.
    pub fn delete<S: AsRef<str>>(&mut self, path: &[S]) -> Option<TreeMapNode<V>> {
        let (last, parent) = path.split_last()?;
        // `shift_remove` keeps sibling order intact.
        self.find_mut(parent)?.children.as_mut()?.shift_remove(last.as_ref())
    }

    /// Take the value at `path`, leaving descendants in place. Nodes along
    /// the path that end up empty are pruned.
    pub fn take<S: AsRef<str>>(&mut self, path: &[S]) -> Option<V> {
        match path.split_first() {
            None => self.value.take(),
            Some((first, rest)) => {
                let children = self.children.as_mut()?;
                let child = children.get_mut(first.as_ref())?;
                let taken = child.take(rest);
                if child.is_empty() {
                    children.shift_remove(first.as_ref());
                }
                taken
            },
        }
    }

    /// `true` when this node has no value and every child is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children().all(|(_, child)| child.is_empty())
    }

    /// Depth-first walk: a node's own value first, then each child subtree in
    /// insertion order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter { stack: vec![self] }
    }

    /// Number of values in this subtree.
    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

impl<'a, V> IntoIterator for &'a TreeMapNode<V> {
    type Item = &'a V;
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`TreeMapNode::iter`].
pub struct Iter<'a, V> {
    stack: Vec<&'a TreeMapNode<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if let Some(children) = &node.children {
                // Reversed so the first child is popped next.
                self.stack.extend(children.values().rev());
            }
            if let Some(value) = &node.value {
                return Some(value);
            }
        }
        None
    }
}
