//! A `MemoryDevice` backed by host memory, for unit tests.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::device::{
    HeapBudget, MemoryAllocateFlags, MemoryHeap, MemoryHeapFlags, MemoryProperties,
    MemoryPropertyFlags, MemoryType,
};
use crate::{DeviceError, DeviceSize, MemoryDevice};

#[derive(Default)]
struct State {
    next_id: u64,
    memory: HashMap<u64, Box<[u8]>>,
    mapped: HashSet<u64>,
    allocate_calls: usize,
    fail_allocations: bool,
    max_allocation_size: Option<DeviceSize>,
    budget: Option<HeapBudget>,
}

pub(crate) struct TestDevice {
    properties: MemoryProperties,
    state: Mutex<State>,
}

impl TestDevice {
    pub(crate) fn new(properties: MemoryProperties) -> Self {
        TestDevice {
            properties,
            state: Mutex::new(State::default()),
        }
    }

    /// One heap with one memory type that is both device-local and
    /// host-visible.
    pub(crate) fn single_heap(heap_size: DeviceSize) -> Self {
        TestDevice::new(MemoryProperties {
            memory_types: vec![MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                    | MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 0,
            }],
            memory_heaps: vec![MemoryHeap {
                size: heap_size,
                flags: MemoryHeapFlags::DEVICE_LOCAL,
            }],
            buffer_image_granularity: 1,
        })
    }

    /// A discrete-GPU-like layout: a device-local heap and a host heap.
    ///
    /// Types: 0 device-local, 1 host-visible coherent, 2 device-local and
    /// host-visible, 3 host-visible coherent cached.
    pub(crate) fn discrete(device_heap: DeviceSize, host_heap: DeviceSize) -> Self {
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        TestDevice::new(MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: host | MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: device_heap,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: host_heap,
                    flags: MemoryHeapFlags::empty(),
                },
            ],
            buffer_image_granularity: 1,
        })
    }

    /// Allocates memory without going through an allocator.
    pub(crate) fn allocate_raw(&self, size: DeviceSize) -> u64 {
        self.allocate_memory(0, size, MemoryAllocateFlags::empty())
            .unwrap()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.lock().unwrap().memory.len()
    }

    pub(crate) fn allocate_calls(&self) -> usize {
        self.state.lock().unwrap().allocate_calls
    }

    pub(crate) fn is_mapped(&self, memory: u64) -> bool {
        self.state.lock().unwrap().mapped.contains(&memory)
    }

    pub(crate) fn set_fail_allocations(&self, fail: bool) {
        self.state.lock().unwrap().fail_allocations = fail;
    }

    pub(crate) fn set_max_allocation_size(&self, max: Option<DeviceSize>) {
        self.state.lock().unwrap().max_allocation_size = max;
    }

    pub(crate) fn set_budget(&self, budget: Option<HeapBudget>) {
        self.state.lock().unwrap().budget = budget;
    }
}

impl MemoryDevice for TestDevice {
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
        assert!((memory_type_index as usize) < self.properties.memory_types.len());
        let mut state = self.state.lock().unwrap();
        state.allocate_calls += 1;
        if state.fail_allocations || state.max_allocation_size.is_some_and(|max| size > max) {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        let id = state.next_id;
        state.next_id += 1;
        state
            .memory
            .insert(id, vec![0; size as usize].into_boxed_slice());
        Ok(id)
    }

    unsafe fn free_memory(&self, memory: u64) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.mapped.contains(&memory), "freeing mapped memory");
        assert!(state.memory.remove(&memory).is_some(), "double free");
    }

    unsafe fn map_memory(&self, memory: &u64, size: DeviceSize) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        assert!(state.mapped.insert(*memory), "memory is already mapped");
        let bytes = state.memory.get_mut(memory).expect("mapping unknown memory");
        assert_eq!(bytes.len() as DeviceSize, size);
        Ok(NonNull::new(bytes.as_mut_ptr()).unwrap())
    }

    unsafe fn unmap_memory(&self, memory: &u64) {
        let mut state = self.state.lock().unwrap();
        assert!(state.mapped.remove(memory), "memory is not mapped");
    }

    fn heap_budget(&self, _heap_index: u32) -> Option<HeapBudget> {
        self.state.lock().unwrap().budget
    }
}
