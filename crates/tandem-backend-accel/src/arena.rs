//! Device memory for the accelerator: blocks addressed by opaque ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem::backend::spec::{BackendError, BackendResult};
use tandem_backend_local::LocalTensor;

pub type BlockId = u64;

#[derive(Default)]
pub struct Arena {
    blocks: Mutex<HashMap<BlockId, Arc<LocalTensor>>>,
    next_id: AtomicU64,
    bytes_in_use: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tensor: LocalTensor) -> BlockId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = tensor.byte_len();
        self.blocks.lock().insert(id, Arc::new(tensor));
        let live = self.bytes_in_use.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        id
    }

    pub fn get(&self, id: BlockId) -> BackendResult<Arc<LocalTensor>> {
        self.blocks
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::execution(format!("accel block {id} is not allocated")))
    }

    pub fn read(&self, id: BlockId, offset: usize, len: usize) -> BackendResult<Vec<u8>> {
        let tensor = self.get(id)?;
        let mut staged = vec![0u8; len];
        tensor.read_into(offset, &mut staged)?;
        Ok(staged)
    }

    pub fn free(&self, id: BlockId) {
        if let Some(tensor) = self.blocks.lock().remove(&id) {
            self.bytes_in_use
                .fetch_sub(tensor.byte_len(), Ordering::Relaxed);
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem::backend::elements::f32_to_bytes;
    use tandem::backend::spec::{DType, TensorSpec};

    #[test]
    fn free_releases_accounting() {
        let arena = Arena::new();
        let spec = TensorSpec::from_dims(DType::F32, &[4]);
        let tensor = LocalTensor::from_bytes(&spec, &f32_to_bytes(&[1.0, 2.0, 3.0, 4.0]))
            .expect("tensor");
        let id = arena.insert(tensor);
        assert_eq!(arena.bytes_in_use(), 16);
        assert_eq!(arena.read(id, 4, 4).expect("read"), 2.0f32.to_le_bytes());
        arena.free(id);
        assert_eq!(arena.bytes_in_use(), 0);
        assert_eq!(arena.peak_bytes(), 16);
        assert!(arena.get(id).is_err());
    }
}
