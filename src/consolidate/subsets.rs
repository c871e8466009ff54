//! Lazy depth-first enumeration of non-empty index subsets

/// Every non-empty subset of `0..n`, as sorted index lists, in depth-first
/// order: each prefix is yielded before its extensions.
///
/// For `n = 3` the sequence is `[0] [0,1] [0,1,2] [0,2] [1] [1,2] [2]`.
#[derive(Debug, Clone)]
pub struct Subsets {
    n: usize,
    stack: Vec<usize>,
    started: bool,
}

impl Subsets {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            stack: Vec::with_capacity(n),
            started: false,
        }
    }

    /// Total number of subsets the iterator yields, saturating at `usize::MAX`
    pub fn total(n: usize) -> usize {
        if n >= usize::BITS as usize {
            usize::MAX
        } else {
            (1usize << n) - 1
        }
    }
}

impl Iterator for Subsets {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if self.n == 0 {
                return None;
            }
            self.stack.push(0);
            return Some(self.stack.clone());
        }

        let last = *self.stack.last()?;
        if last + 1 < self.n {
            self.stack.push(last + 1);
        } else {
            self.stack.pop();
            *self.stack.last_mut()? += 1;
        }
        Some(self.stack.clone())
    }
}

impl std::iter::FusedIterator for Subsets {}
