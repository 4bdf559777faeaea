/// Hands out target ids from one of two disjoint sequences: even ids for
/// targets persisted in the target cache, odd ids for limbo resolutions owned
/// by the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: i32,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { next_id: 2 }
    }

    /// Continues the target cache sequence after the highest id already persisted.
    pub fn for_target_cache_after(highest_target_id: i32) -> Self {
        let mut next_id = highest_target_id.max(0) + 2;
        if next_id % 2 != 0 {
            next_id += 1;
        }
        Self { next_id }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
