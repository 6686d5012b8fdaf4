// SPDX-License-Identifier: MPL-2.0

//! Access-pattern hints and the neighbor windows they select.
//!
//! The windows only decide how many already-resident neighbors a fault maps
//! opportunistically. They are a tuning knob: correctness never depends on
//! their sizes.

/// The maximum number of pages examined by one fault, the center included.
pub const MAX_WINDOW: usize = 16;

/// The access pattern a region expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Advice {
    /// No particular pattern. Look at a few pages on both sides.
    #[default]
    Normal,
    /// Random access. Look at the faulting page only.
    Random,
    /// Sequential access. Look far ahead, and retire the pages behind.
    Sequential,
}

impl Advice {
    pub(crate) const fn index(self) -> usize {
        match self {
            Advice::Normal => 0,
            Advice::Random => 1,
            Advice::Sequential => 2,
        }
    }
}

/// The number of pages examined behind and ahead of a faulting page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdviceWindow {
    pub nback: usize,
    pub nforw: usize,
}

impl AdviceWindow {
    pub const fn new(nback: usize, nforw: usize) -> Self {
        Self { nback, nforw }
    }

    /// Returns whether the window, including the center page, fits in
    /// [`MAX_WINDOW`].
    pub const fn is_valid(&self) -> bool {
        self.nback + self.nforw < MAX_WINDOW
    }
}

/// The default windows, indexed by [`Advice::index`].
pub(crate) const DEFAULT_WINDOWS: [AdviceWindow; 3] = [
    AdviceWindow::new(3, 4),
    AdviceWindow::new(0, 0),
    AdviceWindow::new(8, 7),
];

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_windows_fit() {
        for window in DEFAULT_WINDOWS {
            assert!(window.is_valid());
        }
        assert_eq!(DEFAULT_WINDOWS[Advice::Random.index()].nforw, 0);
        assert!(!AdviceWindow::new(8, 8).is_valid());
    }
}
