//! Immutable, cheaply concatenable batches of values.

use std::{fmt, iter::FusedIterator, sync::Arc};

/// Concatenations deeper than this get flattened into a single buffer.
const MAX_DEPTH: usize = 64;

/// An immutable, ordered, finite batch of values.
///
/// A [`Chunk`] is the unit of transfer between pulls. Cloning is O(1), and so is [`Chunk::concat`]:
/// chunks form a rope of shared slices, so appending a freshly pulled chunk to leftover state does
/// not copy either side. Slicing ([`Chunk::split_at`], [`Chunk::take`], [`Chunk::drop`]) shares
/// the underlying buffers as well.
pub struct Chunk<A> {
    node: Node<A>,
}

enum Node<A> {
    Empty,
    Slice {
        values: Arc<[A]>,
        offset: usize,
        len: usize,
    },
    Concat {
        left: Arc<Node<A>>,
        right: Arc<Node<A>>,
        len: usize,
        depth: usize,
    },
}

impl<A> Clone for Node<A> {
    fn clone(&self) -> Self {
        match self {
            Node::Empty => Node::Empty,
            Node::Slice {
                values,
                offset,
                len,
            } => Node::Slice {
                values: values.clone(),
                offset: *offset,
                len: *len,
            },
            Node::Concat {
                left,
                right,
                len,
                depth,
            } => Node::Concat {
                left: left.clone(),
                right: right.clone(),
                len: *len,
                depth: *depth,
            },
        }
    }
}

impl<A> Node<A> {
    fn len(&self) -> usize {
        match self {
            Node::Empty => 0,
            Node::Slice { len, .. } | Node::Concat { len, .. } => *len,
        }
    }

    fn depth(&self) -> usize {
        match self {
            Node::Concat { depth, .. } => *depth,
            _ => 0,
        }
    }

    fn join(left: Node<A>, right: Node<A>) -> Node<A> {
        match (left.len(), right.len()) {
            (0, _) => right,
            (_, 0) => left,
            (l, r) => Node::Concat {
                depth: left.depth().max(right.depth()) + 1,
                left: Arc::new(left),
                right: Arc::new(right),
                len: l + r,
            },
        }
    }

    fn slice(&self, start: usize, end: usize) -> Node<A> {
        if start >= end {
            return Node::Empty;
        }
        match self {
            Node::Empty => Node::Empty,
            Node::Slice { values, offset, .. } => Node::Slice {
                values: values.clone(),
                offset: offset + start,
                len: end - start,
            },
            Node::Concat { left, right, .. } => {
                let split = left.len();
                if end <= split {
                    left.slice(start, end)
                } else if start >= split {
                    right.slice(start - split, end - split)
                } else {
                    Node::join(left.slice(start, split), right.slice(0, end - split))
                }
            }
        }
    }

    fn get(&self, mut index: usize) -> Option<&A> {
        let mut node = self;
        loop {
            match node {
                Node::Empty => return None,
                Node::Slice {
                    values,
                    offset,
                    len,
                } => {
                    return if index < *len {
                        values.get(offset + index)
                    } else {
                        None
                    }
                }
                Node::Concat { left, right, .. } => {
                    let split = left.len();
                    if index < split {
                        node = &**left;
                    } else {
                        index -= split;
                        node = &**right;
                    }
                }
            }
        }
    }
}

impl<A> Clone for Chunk<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<A> Default for Chunk<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A> Chunk<A> {
    pub const fn empty() -> Self {
        Self { node: Node::Empty }
    }

    /// A chunk holding just `value`.
    pub fn single(value: A) -> Self {
        Self::from_vec(vec![value])
    }

    /// Wraps `values` without copying them.
    pub fn from_vec(values: Vec<A>) -> Self {
        if values.is_empty() {
            return Self::empty();
        }
        let len = values.len();
        Self {
            node: Node::Slice {
                values: values.into(),
                offset: 0,
                len,
            },
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.node.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element at `index`, if there is one.
    pub fn get(&self, index: usize) -> Option<&A> {
        self.node.get(index)
    }

    /// The first element.
    pub fn head(&self) -> Option<&A> {
        self.get(0)
    }

    /// The last element.
    pub fn last(&self) -> Option<&A> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    /// Iterates over the elements in order.
    pub fn iter(&self) -> Iter<'_, A> {
        Iter {
            stack: vec![&self.node],
            current: <&[A]>::default().iter(),
            remaining: self.len(),
        }
    }

    /// Splits the chunk into the first `at` elements and the rest.
    ///
    /// `at` is clamped to the length of the chunk.
    pub fn split_at(&self, at: usize) -> (Chunk<A>, Chunk<A>) {
        let at = at.min(self.len());
        (
            Chunk {
                node: self.node.slice(0, at),
            },
            Chunk {
                node: self.node.slice(at, self.len()),
            },
        )
    }

    /// The first `n` elements, or all of them if there are fewer.
    pub fn take(&self, n: usize) -> Chunk<A> {
        Chunk {
            node: self.node.slice(0, n.min(self.len())),
        }
    }

    /// Everything but the first `n` elements.
    pub fn drop(&self, n: usize) -> Chunk<A> {
        Chunk {
            node: self.node.slice(n.min(self.len()), self.len()),
        }
    }

    /// Applies `f` to every element, in order.
    pub fn map<B, F: FnMut(&A) -> B>(&self, f: F) -> Chunk<B> {
        self.iter().map(f).collect()
    }

    /// Applies `f` to every element, keeping the `Some` results.
    pub fn filter_map<B, F: FnMut(&A) -> Option<B>>(&self, f: F) -> Chunk<B> {
        self.iter().filter_map(f).collect()
    }

    /// Pairs up elements of both chunks, stopping at the end of the shorter one.
    pub fn zip_with<B, C, F: FnMut(&A, &B) -> C>(&self, that: &Chunk<B>, mut f: F) -> Chunk<C> {
        self.iter().zip(that.iter()).map(|(a, b)| f(a, b)).collect()
    }
}

impl<A: Clone> Chunk<A> {
    /// Appends `that` to `self` without copying either.
    pub fn concat(&self, that: &Chunk<A>) -> Chunk<A> {
        let node = Node::join(self.node.clone(), that.node.clone());
        if node.depth() > MAX_DEPTH {
            return Chunk {
                node: Chunk { node }.compact().node,
            };
        }
        Chunk { node }
    }

    /// Keeps the elements `f` returns `true` for.
    pub fn filter<F: FnMut(&A) -> bool>(&self, mut f: F) -> Chunk<A> {
        self.iter().filter(|a| f(a)).cloned().collect()
    }

    /// Copies the elements into a `Vec`.
    pub fn to_vec(&self) -> Vec<A> {
        self.iter().cloned().collect()
    }

    /// Copies the elements into a single contiguous buffer.
    fn compact(&self) -> Chunk<A> {
        Chunk::from_vec(self.to_vec())
    }
}

impl<A> From<Vec<A>> for Chunk<A> {
    fn from(values: Vec<A>) -> Self {
        Self::from_vec(values)
    }
}

impl<A> FromIterator<A> for Chunk<A> {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<'a, A> IntoIterator for &'a Chunk<A> {
    type Item = &'a A;
    type IntoIter = Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<A: PartialEq> PartialEq for Chunk<A> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<A: Eq> Eq for Chunk<A> {}

impl<A: fmt::Debug> fmt::Debug for Chunk<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Borrowing iterator over the elements of a [`Chunk`].
pub struct Iter<'a, A> {
    stack: Vec<&'a Node<A>>,
    current: std::slice::Iter<'a, A>,
    remaining: usize,
}

impl<'a, A> Iterator for Iter<'a, A> {
    type Item = &'a A;

    fn next(&mut self) -> Option<&'a A> {
        loop {
            if let Some(value) = self.current.next() {
                self.remaining -= 1;
                return Some(value);
            }
            match self.stack.pop()? {
                Node::Empty => {}
                Node::Slice {
                    values,
                    offset,
                    len,
                } => self.current = values[*offset..*offset + *len].iter(),
                Node::Concat { left, right, .. } => {
                    self.stack.push(&**right);
                    self.stack.push(&**left);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<A> ExactSizeIterator for Iter<'_, A> {}

impl<A> FusedIterator for Iter<'_, A> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn chunk_is_send_sync() {
        assert_send_sync::<Chunk<String>>();
    }

    #[test]
    fn concat_preserves_order() {
        let a = Chunk::from_vec(vec![1, 2]);
        let b = Chunk::from_vec(vec![3]);
        let c = Chunk::from_vec(vec![4, 5, 6]);
        let joined = a.concat(&b).concat(&c);

        assert_eq!(joined.len(), 6);
        assert_eq!(joined.to_vec(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(joined.get(3), Some(&4));
        assert_eq!(joined.get(6), None);
        assert_eq!(joined.last(), Some(&6));
    }

    #[test]
    fn concat_with_empty_is_identity() {
        let a = Chunk::from_vec(vec![1, 2]);
        assert_eq!(a.concat(&Chunk::empty()), a);
        assert_eq!(Chunk::empty().concat(&a), a);
        assert!(Chunk::<u8>::empty().concat(&Chunk::empty()).is_empty());
    }

    #[test]
    fn slicing_across_concat_boundary() {
        let joined = Chunk::from_vec(vec![1, 2, 3]).concat(&Chunk::from_vec(vec![4, 5]));
        let (front, back) = joined.split_at(2);
        assert_eq!(front.to_vec(), vec![1, 2]);
        assert_eq!(back.to_vec(), vec![3, 4, 5]);

        let middle = joined.drop(1).take(3);
        assert_eq!(middle.to_vec(), vec![2, 3, 4]);
        assert_eq!(joined.take(10), joined);
        assert!(joined.drop(10).is_empty());
    }

    #[test]
    fn deep_concatenation_stays_correct() {
        let mut acc = Chunk::empty();
        for i in 0..1000 {
            acc = acc.concat(&Chunk::single(i));
        }
        assert_eq!(acc.len(), 1000);
        assert_eq!(acc.to_vec(), (0..1000).collect::<Vec<_>>());
        assert_eq!(acc.get(999), Some(&999));
    }

    #[test]
    fn element_wise_operations() {
        let chunk: Chunk<i32> = (1..=6).collect();
        assert_eq!(chunk.map(|n| n * 10).to_vec(), vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(chunk.filter(|n| n % 2 == 0).to_vec(), vec![2, 4, 6]);
        assert_eq!(
            chunk.filter_map(|n| (*n > 4).then(|| n.to_string())).to_vec(),
            vec!["5".to_string(), "6".to_string()]
        );
        let letters = Chunk::from_vec(vec!['a', 'b']);
        assert_eq!(
            chunk.zip_with(&letters, |n, c| (*n, *c)).to_vec(),
            vec![(1, 'a'), (2, 'b')]
        );
        assert_eq!(chunk.iter().len(), 6);
    }
}
