/// In-memory buffer collecting items until the next flush
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> BatchAccumulator<T> {
    pub fn new(capacity: usize) -> BatchAccumulator<T> {
        BatchAccumulator {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item and returns the new buffer size
    pub fn append(&mut self, item: T) -> usize {
        self.items.push(item);
        self.items.len()
    }

    /// Removes and returns every buffered item, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.capacity))
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
