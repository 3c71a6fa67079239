// Descriptor layouts, pools, sets and the per-frame cache
//
// Pools are keyed by layout description and sets by the full binding key,
// both scoped by a concurrency index. Keys are compared with `Eq` behind the
// hash, so two different binding lists can never alias one cached set.
// Nothing is evicted; the owning frame clears everything at destruction.

use ash::vk;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{BackendError, BackendResult, VkResultExt};
use super::DeviceContext;

/// Sets allocated from one pool before another is chained
pub const SETS_PER_POOL: u32 = 64;

/// One binding slot of a set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    pub fn new(binding: u32, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stages,
        }
    }
}

/// Structural description of a descriptor set layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutDesc {
    pub fn new(bindings: impl Into<Vec<LayoutBinding>>) -> Self {
        Self {
            bindings: bindings.into(),
        }
    }

    /// Pool capacity for `sets` sets of this layout, one entry per descriptor type
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.count * sets;
            match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: count,
                }),
            }
        }
        sizes
    }
}

/// A buffer range bound at `binding`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

impl BufferBinding {
    pub fn uniform(binding: u32, buffer: vk::Buffer, range: vk::DeviceSize) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            buffer,
            offset: 0,
            range,
        }
    }
}

/// An image view (and optional sampler) bound at `binding`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub sampler: vk::Sampler,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

/// Everything that identifies a cached descriptor set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetKey {
    pub layout: DescriptorSetLayoutDesc,
    pub buffers: Vec<BufferBinding>,
    pub images: Vec<ImageBinding>,
}

/// Store for pools and sets, generic over what a pool and a set are.
/// Misses call back into the owner to create the native object.
pub struct DescriptorCache<P, S> {
    pools: HashMap<(u32, DescriptorSetLayoutDesc), P>,
    sets: HashMap<(u32, DescriptorSetKey), S>,
}

impl<P, S> Default for DescriptorCache<P, S> {
    fn default() -> Self {
        Self {
            pools: HashMap::new(),
            sets: HashMap::new(),
        }
    }
}

impl<P, S> DescriptorCache<P, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn pool_or_insert_with<E>(
        &mut self,
        concurrency_index: u32,
        layout: &DescriptorSetLayoutDesc,
        create: impl FnOnce() -> Result<P, E>,
    ) -> Result<&mut P, E> {
        match self.pools.entry((concurrency_index, layout.clone())) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(create()?)),
        }
    }

    /// Look up the set for `key`, creating it (and its pool, if needed) on a miss
    pub fn set_or_insert_with<E>(
        &mut self,
        concurrency_index: u32,
        key: DescriptorSetKey,
        create_pool: impl FnOnce() -> Result<P, E>,
        create_set: impl FnOnce(&mut P) -> Result<S, E>,
    ) -> Result<&mut S, E> {
        match self.sets.entry((concurrency_index, key)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pool_key = (concurrency_index, entry.key().1.layout.clone());
                let pool = match self.pools.entry(pool_key) {
                    Entry::Occupied(pool) => pool.into_mut(),
                    Entry::Vacant(pool) => pool.insert(create_pool()?),
                };
                let set = create_set(pool)?;
                Ok(entry.insert(set))
            }
        }
    }

    /// Every cached set under one concurrency index
    pub fn sets_mut(&mut self, concurrency_index: u32) -> impl Iterator<Item = &mut S> + '_ {
        self.sets
            .iter_mut()
            .filter(move |((index, _), _)| *index == concurrency_index)
            .map(|(_, set)| set)
    }

    /// Empty the cache, sets before pools
    pub fn drain(&mut self) -> (Vec<S>, Vec<P>) {
        let sets = self.sets.drain().map(|(_, set)| set).collect();
        let pools = self.pools.drain().map(|(_, pool)| pool).collect();
        (sets, pools)
    }
}

/// Owned descriptor set layout
pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    desc: DescriptorSetLayoutDesc,
    context: Arc<DeviceContext>,
}

impl DescriptorSetLayout {
    pub fn new(context: Arc<DeviceContext>, desc: DescriptorSetLayoutDesc) -> BackendResult<Self> {
        let bindings: Vec<_> = desc
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let handle = unsafe { context.device.create_descriptor_set_layout(&create_info, None) }
            .or_init_fail("descriptor set layout")?;

        Ok(Self {
            handle,
            desc,
            context,
        })
    }

    pub fn desc(&self) -> &DescriptorSetLayoutDesc {
        &self.desc
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

/// Whether an allocation failure means "this pool is full"
pub fn is_pool_exhausted(code: vk::Result) -> bool {
    matches!(
        code,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL
    )
}

/// Chain of native pools serving one layout
pub struct DescriptorPool {
    pools: Vec<vk::DescriptorPool>,
    allocated_in_current: u32,
    sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorPool {
    pub fn new(device: &ash::Device, layout: &DescriptorSetLayoutDesc) -> BackendResult<Self> {
        let mut pool = Self {
            pools: Vec::new(),
            allocated_in_current: 0,
            sizes: layout.pool_sizes(SETS_PER_POOL),
        };
        pool.chain(device)?;
        Ok(pool)
    }

    fn chain(&mut self, device: &ash::Device) -> BackendResult<()> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&self.sizes);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None) }
            .or_alloc_fail("descriptor pool")?;

        if !self.pools.is_empty() {
            log::debug!("Descriptor pool exhausted, chaining pool #{}", self.pools.len() + 1);
        }
        self.pools.push(pool);
        self.allocated_in_current = 0;
        Ok(())
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> BackendResult<vk::DescriptorSet> {
        if self.allocated_in_current >= SETS_PER_POOL {
            self.chain(device)?;
        }

        match self.try_allocate(device, layout) {
            Ok(set) => Ok(set),
            Err(code) if is_pool_exhausted(code) => {
                self.chain(device)?;
                self.try_allocate(device, layout)
                    .or_alloc_fail("descriptor set")
            }
            Err(code) => Err(BackendError::Allocation {
                what: "descriptor set",
                code,
            }),
        }
    }

    fn try_allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let pool = *self.pools.last().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)?;
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }?[0];
        self.allocated_in_current += 1;
        Ok(set)
    }

    /// Destroying a pool releases every set allocated from it
    pub fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}

/// Cached descriptor set with the writes it still has to flush
pub struct DescriptorSet {
    pub handle: vk::DescriptorSet,
    buffers: Vec<BufferBinding>,
    images: Vec<ImageBinding>,
    dirty: bool,
}

impl DescriptorSet {
    pub fn new(handle: vk::DescriptorSet, key: &DescriptorSetKey) -> Self {
        Self {
            handle,
            buffers: key.buffers.clone(),
            images: key.images.clone(),
            dirty: true,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        self.dirty
    }

    /// The set's writes, handed out exactly once
    pub fn take_pending_writes(&mut self) -> Option<SetWrites> {
        if !self.has_pending_writes() {
            return None;
        }
        self.dirty = false;

        Some(SetWrites {
            set: self.handle,
            buffers: std::mem::take(&mut self.buffers),
            images: std::mem::take(&mut self.images),
        })
    }
}

impl<P> DescriptorCache<P, DescriptorSet> {
    /// Writes for every set under `concurrency_index` not flushed yet
    pub fn take_pending_writes(&mut self, concurrency_index: u32) -> Vec<SetWrites> {
        self.sets_mut(concurrency_index)
            .filter_map(DescriptorSet::take_pending_writes)
            .collect()
    }
}

/// Bindings of one set that still have to reach the device
pub struct SetWrites {
    pub set: vk::DescriptorSet,
    buffers: Vec<BufferBinding>,
    images: Vec<ImageBinding>,
}

impl SetWrites {
    pub fn write_count(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    pub fn apply(&self, device: &ash::Device) {
        let buffer_infos: Vec<_> = self
            .buffers
            .iter()
            .map(|b| vk::DescriptorBufferInfo {
                buffer: b.buffer,
                offset: b.offset,
                range: b.range,
            })
            .collect();
        let image_infos: Vec<_> = self
            .images
            .iter()
            .map(|i| vk::DescriptorImageInfo {
                sampler: i.sampler,
                image_view: i.view,
                image_layout: i.layout,
            })
            .collect();

        let writes: Vec<_> = self
            .buffers
            .iter()
            .zip(&buffer_infos)
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .chain(self.images.iter().zip(&image_infos).map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .image_info(std::slice::from_ref(info))
                    .build()
            }))
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::Cell;

    fn uniform_layout() -> DescriptorSetLayoutDesc {
        DescriptorSetLayoutDesc::new([LayoutBinding::new(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::FRAGMENT,
        )])
    }

    fn key(buffer: u64) -> DescriptorSetKey {
        DescriptorSetKey {
            layout: uniform_layout(),
            buffers: vec![BufferBinding::uniform(0, vk::Buffer::from_raw(buffer), 64)],
            images: vec![],
        }
    }

    /// Stand-ins for native objects, numbered in creation order
    #[derive(Default)]
    struct Counter {
        pools: Cell<u32>,
        sets: Cell<u32>,
    }

    impl Counter {
        fn bump(cell: &Cell<u32>) -> u32 {
            cell.set(cell.get() + 1);
            cell.get()
        }
    }

    fn lookup(
        cache: &mut DescriptorCache<u32, (u32, u32)>,
        counter: &Counter,
        index: u32,
        key: DescriptorSetKey,
    ) -> (u32, u32) {
        let result: Result<_, ()> = cache.set_or_insert_with(
            index,
            key,
            || Ok(Counter::bump(&counter.pools)),
            |pool| Ok((*pool, Counter::bump(&counter.sets))),
        );
        *result.unwrap()
    }

    #[test]
    fn same_bindings_return_the_same_set() {
        let mut cache = DescriptorCache::new();
        let counter = Counter::default();

        let first = lookup(&mut cache, &counter, 0, key(1));
        let second = lookup(&mut cache, &counter, 0, key(1));

        assert_eq!(first, second);
        assert_eq!(cache.set_count(), 1);
        assert_eq!(counter.sets.get(), 1);
    }

    #[test]
    fn different_bindings_share_the_layout_pool() {
        let mut cache = DescriptorCache::new();
        let counter = Counter::default();

        let (pool_a, set_a) = lookup(&mut cache, &counter, 0, key(1));
        let (pool_b, set_b) = lookup(&mut cache, &counter, 0, key(2));

        assert_ne!(set_a, set_b);
        assert_eq!(pool_a, pool_b);
        assert_eq!(cache.pool_count(), 1);
        assert_eq!(cache.set_count(), 2);
    }

    #[test]
    fn concurrency_indices_are_isolated() {
        let mut cache = DescriptorCache::new();
        let counter = Counter::default();

        let (pool_a, set_a) = lookup(&mut cache, &counter, 0, key(1));
        let (pool_b, set_b) = lookup(&mut cache, &counter, 1, key(1));

        assert_ne!(pool_a, pool_b);
        assert_ne!(set_a, set_b);
        assert_eq!(cache.sets_mut(0).count(), 1);
        assert_eq!(cache.sets_mut(1).count(), 1);
    }

    #[test]
    fn binding_order_is_part_of_the_key() {
        let a = BufferBinding::uniform(0, vk::Buffer::from_raw(1), 64);
        let b = BufferBinding::uniform(1, vk::Buffer::from_raw(2), 64);

        let forward = DescriptorSetKey {
            layout: uniform_layout(),
            buffers: vec![a, b],
            images: vec![],
        };
        let reversed = DescriptorSetKey {
            buffers: vec![b, a],
            ..forward.clone()
        };

        assert_ne!(forward, reversed);
    }

    #[test]
    fn pool_lookup_reuses_existing_pool() {
        let mut cache: DescriptorCache<u32, ()> = DescriptorCache::new();
        let layout = uniform_layout();

        let first: Result<_, ()> = cache.pool_or_insert_with(3, &layout, || Ok(7));
        assert_eq!(*first.unwrap(), 7);

        let second: Result<_, ()> = cache.pool_or_insert_with(3, &layout, || Ok(8));
        assert_eq!(*second.unwrap(), 7);
    }

    #[test]
    fn failed_creation_caches_nothing() {
        let mut cache: DescriptorCache<u32, u32> = DescriptorCache::new();

        let result = cache.set_or_insert_with(0, key(1), || Ok(1), |_| Err("out of memory"));
        assert!(result.is_err());
        assert_eq!(cache.set_count(), 0);
    }

    #[test]
    fn drain_empties_sets_and_pools() {
        let mut cache = DescriptorCache::new();
        let counter = Counter::default();
        lookup(&mut cache, &counter, 0, key(1));
        lookup(&mut cache, &counter, 1, key(2));

        let (sets, pools) = cache.drain();
        assert_eq!(sets.len(), 2);
        assert_eq!(pools.len(), 2);
        assert_eq!(cache.set_count(), 0);
        assert_eq!(cache.pool_count(), 0);
    }

    #[test]
    fn pool_sizes_merge_descriptor_types() {
        let layout = DescriptorSetLayoutDesc::new([
            LayoutBinding::new(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX),
            LayoutBinding::new(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
            LayoutBinding::new(2, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT),
        ]);
        let sizes = layout.pool_sizes(4);

        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 8);
        assert_eq!(sizes[1].descriptor_count, 4);
    }

    #[test]
    fn exhausted_pool_codes() {
        assert!(is_pool_exhausted(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        assert!(is_pool_exhausted(vk::Result::ERROR_FRAGMENTED_POOL));
        assert!(!is_pool_exhausted(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
    }

    #[test]
    fn new_set_has_pending_writes() {
        let set = DescriptorSet::new(vk::DescriptorSet::null(), &key(1));
        assert!(set.has_pending_writes());
    }

    fn cached_set(cache: &mut DescriptorCache<u32, DescriptorSet>, index: u32, key: DescriptorSetKey) {
        let handle = vk::DescriptorSet::from_raw(100 + cache.set_count() as u64);
        let result: Result<_, ()> =
            cache.set_or_insert_with(index, key.clone(), || Ok(0), |_| Ok(DescriptorSet::new(handle, &key)));
        result.unwrap();
    }

    #[test]
    fn pending_writes_are_handed_out_once() {
        let mut cache = DescriptorCache::new();
        cached_set(&mut cache, 0, key(1));

        let first = cache.take_pending_writes(0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].write_count(), 1);

        assert!(cache.take_pending_writes(0).is_empty());

        // Looking the same set up again does not make it dirty
        cached_set(&mut cache, 0, key(1));
        assert!(cache.take_pending_writes(0).is_empty());
    }

    #[test]
    fn pending_writes_stay_within_their_concurrency_index() {
        let mut cache = DescriptorCache::new();
        cached_set(&mut cache, 0, key(1));
        cached_set(&mut cache, 1, key(1));
        cached_set(&mut cache, 1, key(2));

        assert_eq!(cache.take_pending_writes(1).len(), 2);
        assert!(cache.take_pending_writes(1).is_empty());

        assert_eq!(cache.take_pending_writes(0).len(), 1);
        assert!(cache.take_pending_writes(0).is_empty());
    }
}
