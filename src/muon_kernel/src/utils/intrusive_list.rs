//! Intrusive circular doubly-linked lists.
//!
//! Links are embedded in the linked entities themselves, so linking and
//! unlinking never allocate. The links are stored in cells
//! (see [`CellLike`]) so that list elements can be shared while the list
//! is mutated under the kernel's interrupt critical section.
//!
//! A list is operated through a short-lived [`ListAccessorCell`], which
//! combines the head cell, a *pool* translating an index to an element
//! reference, a closure mapping an element to its link cell, and the
//! cell key (usually a borrow of the CPU Lock token).
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Circular linked list header. `first` designates the head; the tail
/// is reached through `first.prev`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self::new();
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

/// Links to the neighbor elements. `None` in the element's link cell
/// means the element is not in the list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A minimal mutable-cell abstraction, keyed so that token-guarded cells
/// can participate.
pub(crate) trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<'a, Element: Clone, Keyhole, Key> CellLike<&'a mut Key>
    for tokenlock::UnsyncTokenLock<Element, Keyhole>
where
    Key: tokenlock::Token<Keyhole> + tokenlock::Unsync,
{
    type Target = Element;

    fn get(&self, key: &&'a mut Key) -> Self::Target {
        self.read(*key).clone()
    }
    fn set(&self, key: &mut &'a mut Key, value: Self::Target) {
        self.replace(*key, value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// A virtual pool whose elements are reached by dereferencing the index
/// itself. Every module that links heap- or stack-resident nodes defines
/// an `ops::Index` impl over this for its own reference type.
///
/// # Safety
///
/// All pointees accessed through a given `UnsafeStatic` must be valid
/// whenever an accessor built on it is used. The kernel upholds this by
/// never leaving a dangling node linked in any list.
pub(crate) struct UnsafeStatic {
    _nonexhaustive: (),
}

impl UnsafeStatic {
    /// # Safety
    ///
    /// See the type-level documentation.
    #[inline]
    pub const unsafe fn new() -> &'static Self {
        &Self { _nonexhaustive: () }
    }
}

/// Cell-based accessor to a linked list.
///
/// The structure is assumed to be consistent; a link that contradicts
/// the head is a kernel bug and trips a debug assertion.
pub(crate) struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        Self {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    fn link_of(&self, i: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[i]).get(&self.cell_key)
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    pub fn is_linked(&self, i: Index) -> bool {
        self.link_of(i).is_some()
    }

    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    pub fn back(&self) -> Option<Index> {
        self.head().first.map(|first| {
            debug_assert!(self.link_of(first.clone()).is_some(), "inconsistent list");
            self.link_of(first).unwrap().prev
        })
    }

    /// Insert `item` before `at`, or at the back when `at` is `None`.
    ///
    /// `item` must not currently be linked in any list through this link
    /// cell.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(
            self.link_of(item.clone()).is_none(),
            "element is already linked"
        );

        let mut head = self.head();

        if let Some(first) = head.first.clone() {
            let (next, update_first) = match at {
                Some(at) => {
                    let update_first = at == first;
                    (at, update_first)
                }
                None => (first, false),
            };

            let prev = self.link_of(next.clone()).expect("inconsistent list").prev;

            // prev.next = item
            let mut l = self.link_of(prev.clone()).expect("inconsistent list");
            l.next = item.clone();
            (self.map_link)(&self.pool[prev.clone()]).set(&mut self.cell_key, Some(l));

            // next.prev = item
            let mut l = self.link_of(next.clone()).expect("inconsistent list");
            l.prev = item.clone();
            (self.map_link)(&self.pool[next.clone()]).set(&mut self.cell_key, Some(l));

            // item.{prev, next}
            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            (self.map_link)(&self.pool[item.clone()]).set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }
    }

    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    /// Unlink `item`. Does nothing if the element is not linked.
    pub fn remove(&mut self, item: Index) -> bool {
        let link = match self.link_of(item.clone()) {
            Some(link) => link,
            None => return false,
        };

        let mut head = self.head();
        if head.first.as_ref() == Some(&item) {
            if link.next == item {
                // The list just became empty
                head.first = None;
                self.set_head(head);
                (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);
                return true;
            }
            head.first = Some(link.next.clone());
            self.set_head(head);
        }

        // link.prev.next = link.next
        let mut l = self
            .link_of(link.prev.clone())
            .expect("inconsistent list");
        l.next = link.next.clone();
        (self.map_link)(&self.pool[link.prev.clone()]).set(&mut self.cell_key, Some(l));

        // link.next.prev = link.prev
        let mut l = self
            .link_of(link.next.clone())
            .expect("inconsistent list");
        l.prev = link.prev.clone();
        (self.map_link)(&self.pool[link.next]).set(&mut self.cell_key, Some(l));

        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);
        true
    }

    pub fn pop_front(&mut self) -> Option<Index> {
        let first = self.front()?;
        self.remove(first.clone());
        Some(first)
    }

    /// The element after `i`, or `None` if `i` is the tail.
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link_of(i).expect("element is not linked").next;
        if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        }
    }

    /// The element before `i`, or `None` if `i` is the head.
    pub fn prev(&self, i: Index) -> Option<Index> {
        if Some(&i) == self.head().first.as_ref() {
            None
        } else {
            Some(self.link_of(i).expect("element is not linked").prev)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::cell::Cell;

    type El = (u32, Cell<Option<Link<usize>>>);

    fn push(pool: &mut Vec<El>, x: u32) -> usize {
        pool.push((x, Cell::new(None)));
        pool.len() - 1
    }

    macro_rules! accessor {
        ($head:expr, $pool:expr) => {
            ListAccessorCell::new(&$head, &$pool, |e: &El| &e.1, ())
        };
    }

    fn collect(
        acc: &ListAccessorCell<'_, &Cell<ListHead<usize>>, Vec<El>, impl Fn(&El) -> &Cell<Option<Link<usize>>>, ()>,
    ) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = acc.front();
        while let Some(i) = cur {
            out.push(acc.pool()[i].0);
            cur = acc.next(i);
        }
        out
    }

    #[test]
    fn basic() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let a = push(&mut pool, 1);
        let b = push(&mut pool, 2);
        let c = push(&mut pool, 3);

        let mut acc = accessor!(head, pool);
        acc.push_back(a);
        acc.push_back(b);
        acc.insert(c, Some(a));

        assert_eq!(collect(&acc), vec![3, 1, 2]);
        assert_eq!(acc.front(), Some(c));
        assert_eq!(acc.back(), Some(b));
        assert_eq!(acc.next(c), Some(a));
        assert_eq!(acc.prev(c), None);
        assert_eq!(acc.prev(b), Some(a));

        assert!(acc.remove(a));
        assert!(!acc.remove(a));
        assert_eq!(collect(&acc), vec![3, 2]);
        acc.remove(c);
        acc.remove(b);
        assert!(acc.is_empty());
        for e in pool.iter() {
            assert!(e.1.get().is_none());
        }
    }

    #[test]
    fn pop_front_drains_in_order() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        let ids: Vec<usize> = (0..5).map(|x| push(&mut pool, x)).collect();

        let mut acc = accessor!(head, pool);
        for &i in &ids {
            acc.push_back(i);
        }
        let mut drained = Vec::new();
        while let Some(i) = acc.pop_front() {
            drained.push(acc.pool()[i].0);
        }
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    /// Random insert/remove sequences agree with a `Vec` model.
    #[quickcheck]
    fn matches_vec_model(ops: Vec<(bool, u8)>) -> bool {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        for i in 0..8u32 {
            push(&mut pool, i);
        }
        let mut model: Vec<usize> = Vec::new();

        let mut acc = accessor!(head, pool);
        for (is_insert, raw) in ops {
            let i = (raw % 8) as usize;
            if is_insert {
                if !model.contains(&i) {
                    acc.push_back(i);
                    model.push(i);
                }
            } else {
                acc.remove(i);
                model.retain(|&x| x != i);
            }
            let got = collect(&acc);
            let want: Vec<u32> = model.iter().map(|&x| x as u32).collect();
            if got != want {
                return false;
            }
        }
        true
    }
}
