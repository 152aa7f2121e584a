use std::sync::Mutex;
use tracing::trace;

/// A bounded free list for recycling work items, handler contexts and payload
///  buffers on the request hot path.
///
/// `get` falls back to the factory when the list is empty and `put` discards
///  when it is full, so correctness never depends on an object actually being
///  reused. Pools are per-endpoint fields rather than process globals, which
///  keeps endpoints independent and lets tests run them in parallel.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    max_size: usize,
}

impl<T> Pool<T> {
    pub fn new(max_size: usize) -> Pool<T> {
        Pool {
            items: Mutex::new(Vec::new()),
            max_size,
        }
    }

    pub fn get(&self, create: impl FnOnce() -> T) -> T {
        if let Some(item) = self.items.lock().unwrap().pop() {
            trace!("returning object from pool");
            return item;
        }
        create()
    }

    pub fn put(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        if items.len() < self.max_size {
            items.push(item);
        } else {
            trace!("pool is full: discarding returned object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_creates_when_empty() {
        let pool: Pool<Vec<u8>> = Pool::new(2);
        let buf = pool.get(|| vec![0u8; 8]);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_put_then_get_reuses() {
        let pool: Pool<Vec<u8>> = Pool::new(2);
        pool.put(vec![1, 2, 3]);

        let buf = pool.get(|| unreachable!("pool should not be empty"));
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_pool_discards() {
        let pool: Pool<u32> = Pool::new(1);
        pool.put(1);
        pool.put(2);

        assert_eq!(pool.get(|| 99), 1);
        assert_eq!(pool.get(|| 99), 99);
    }
}
