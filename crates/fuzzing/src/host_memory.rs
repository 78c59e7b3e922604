//! A `MemoryDevice` backed by host memory, for driving the allocator without a
//! GPU.

use device_suballoc::{
    DeviceError, DeviceSize, MemoryAllocateFlags, MemoryDevice, MemoryHeap, MemoryHeapFlags,
    MemoryProperties, MemoryPropertyFlags, MemoryType,
};
use std::{
    collections::BTreeMap,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

/// One emulated device memory object.
struct MemoryObject {
    bytes: Box<[u8]>,
    memory_type_index: u32,
    mapped: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    objects: BTreeMap<u64, MemoryObject>,
}

/// Emulates device memory with boxed byte slices.
///
/// Clones share the same memory, so a test can keep a handle to inspect the
/// device after giving one to an allocator. Misuse of the device interface,
/// such as freeing a mapped object or mapping memory twice, panics.
#[derive(Clone)]
pub struct HostMemoryDevice {
    properties: MemoryProperties,
    max_objects: usize,
    state: Arc<Mutex<State>>,
}

impl HostMemoryDevice {
    /// A device with the given memory layout that refuses to hold more than
    /// `max_objects` memory objects at once.
    pub fn new(properties: MemoryProperties, max_objects: usize) -> Self {
        HostMemoryDevice {
            properties,
            max_objects,
            state: Arc::default(),
        }
    }

    /// A small discrete-GPU-like device.
    ///
    /// | index | properties                                | heap |
    /// |-------|-------------------------------------------|------|
    /// | 0     | device local                              | 0    |
    /// | 1     | host visible, host coherent               | 1    |
    /// | 2     | device local, host visible, host coherent | 0    |
    /// | 3     | host visible, host coherent, host cached  | 1    |
    pub fn discrete(heap_size: DeviceSize, buffer_image_granularity: DeviceSize) -> Self {
        type P = MemoryPropertyFlags;
        let host = P::HOST_VISIBLE | P::HOST_COHERENT;
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: P::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: P::DEVICE_LOCAL | host,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host | P::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: heap_size,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: heap_size,
                    flags: MemoryHeapFlags::empty(),
                },
            ],
            buffer_image_granularity,
        };
        HostMemoryDevice::new(properties, 64)
    }

    /// Number of memory objects currently allocated.
    pub fn live_objects(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Number of memory objects currently mapped.
    pub fn mapped_objects(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.values().filter(|o| o.mapped).count()
    }

    /// Size of a live memory object.
    pub fn object_size(&self, memory: u64) -> Option<DeviceSize> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&memory)
            .map(|o| o.bytes.len() as DeviceSize)
    }
}

impl MemoryDevice for HostMemoryDevice {
    type Memory = u64;

    fn properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
        _flags: MemoryAllocateFlags,
    ) -> Result<u64, DeviceError> {
        assert!(
            (memory_type_index as usize) < self.properties.memory_types.len(),
            "allocation from unknown memory type {memory_type_index}"
        );
        assert!(size > 0, "zero-sized device allocation");

        let mut state = self.state.lock().unwrap();
        if state.objects.len() >= self.max_objects {
            return Err(DeviceError::TooManyObjects);
        }
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfDeviceMemory)?;

        let id = state.next_id;
        state.next_id += 1;
        state.objects.insert(
            id,
            MemoryObject {
                bytes: vec![0; len].into_boxed_slice(),
                memory_type_index,
                mapped: false,
            },
        );
        log::trace!("device: allocated memory {id} of {size} bytes");
        Ok(id)
    }

    unsafe fn free_memory(&self, memory: u64) {
        let mut state = self.state.lock().unwrap();
        let object = state
            .objects
            .remove(&memory)
            .unwrap_or_else(|| panic!("free of unknown memory {memory}"));
        assert!(!object.mapped, "free of mapped memory {memory}");
        log::trace!("device: freed memory {memory}");
    }

    unsafe fn map_memory(&self, memory: &u64, size: DeviceSize) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let object = state
            .objects
            .get_mut(memory)
            .unwrap_or_else(|| panic!("map of unknown memory {memory}"));
        assert!(!object.mapped, "memory {memory} mapped twice");
        assert_eq!(object.bytes.len() as DeviceSize, size);

        let flags = self.properties.memory_types[object.memory_type_index as usize].property_flags;
        if !flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(DeviceError::MemoryMapFailed);
        }
        object.mapped = true;
        NonNull::new(object.bytes.as_mut_ptr()).ok_or(DeviceError::MemoryMapFailed)
    }

    unsafe fn unmap_memory(&self, memory: &u64) {
        let mut state = self.state.lock().unwrap();
        let object = state
            .objects
            .get_mut(memory)
            .unwrap_or_else(|| panic!("unmap of unknown memory {memory}"));
        assert!(object.mapped, "unmap of memory {memory} that is not mapped");
        object.mapped = false;
    }
}
