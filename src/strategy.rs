use crate::error::StreamResult;

/// Queue accounting policy: how big a chunk is and how much the queue should
/// hold before backpressure engages.
///
/// `size` is fallible; a failing size function is treated as an immediate
/// controller error by both stream sides.
pub trait QueuingStrategy<T>: Send + 'static {
    /// Return the size of the chunk.
    fn size(&self, chunk: &T) -> StreamResult<usize>;
    /// Return the high water mark (desired max queue size).
    fn high_water_mark(&self) -> usize;
}

pub type BoxedStrategy<T> = Box<dyn QueuingStrategy<T>>;

/// Count-based strategy: every chunk has size 1.
#[derive(Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<usize> {
        Ok(1)
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte-length strategy for chunk types with a known byte size.
#[derive(Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> StreamResult<usize> {
        Ok(chunk.len())
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> StreamResult<usize> {
        Ok(chunk.len())
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_strategy_sizes_every_chunk_as_one() {
        let s = CountQueuingStrategy::new(4);
        assert_eq!(QueuingStrategy::<i32>::size(&s, &7).unwrap(), 1);
        assert_eq!(QueuingStrategy::<i32>::high_water_mark(&s), 4);
    }

    #[test]
    fn byte_length_strategy_uses_chunk_len() {
        let s = ByteLengthQueuingStrategy::new(1024);
        assert_eq!(s.size(&vec![0u8; 37]).unwrap(), 37);
        assert_eq!(s.size(&"hello".to_string()).unwrap(), 5);
    }
}
