use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fixed-length buffer of 32-bit words that crosses heap boundaries without
/// cloning. The atomic memory layer operates on its words directly; plain
/// loads and stores go through here too so mixed access stays coherent.
pub struct SharedArray {
    words: Box<[AtomicU32]>,
}

impl SharedArray {
    pub fn new(len: usize) -> SharedArray {
        SharedArray {
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn from_words(init: &[u32]) -> SharedArray {
        SharedArray {
            words: init.iter().map(|&w| AtomicU32::new(w)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, index: usize) -> Option<&AtomicU32> {
        self.words.get(index)
    }

    pub fn load(&self, index: usize) -> Option<u32> {
        self.words.get(index).map(|w| w.load(Ordering::SeqCst))
    }

    pub fn store(&self, index: usize, value: u32) -> bool {
        match self.words.get(index) {
            Some(w) => {
                w.store(value, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedArray(len={})", self.words.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_roundtrip() {
        let arr = SharedArray::new(4);
        assert_eq!(arr.len(), 4);
        assert!(arr.store(2, 99));
        assert_eq!(arr.load(2), Some(99));
        assert_eq!(arr.load(4), None);
        assert!(!arr.store(4, 1));
    }

    #[test]
    fn from_words_preserves_contents() {
        let arr = SharedArray::from_words(&[1, 2, 3]);
        assert_eq!(arr.load(0), Some(1));
        assert_eq!(arr.load(2), Some(3));
    }
}
