//! Shared fuzzing and testing infrastructure for `device_suballoc`.

mod host_memory;

pub use host_memory::HostMemoryDevice;

use device_suballoc::{
    Allocation, AllocationCreateFlags, AllocationCreateInfo, AllocationError, Allocator,
    AllocatorCreateInfo, DeviceError, DeviceSize, LockingMechanism, MapError, MemoryPropertyFlags,
    MemoryRequirements, MemoryUsage, PoolCreateFlags, PoolCreateInfo, PoolId, SingleThreadedLock,
    SuballocationType, FRAME_INDEX_LOST,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ptr::NonNull};

const KIB: DeviceSize = 1 << 10;
const MIB: DeviceSize = 1 << 20;

/// Size of each heap of the device that test operations run against.
pub const HEAP_SIZE: DeviceSize = 16 * MIB;

/// Buffer-image granularity of that device.
pub const BUFFER_IMAGE_GRANULARITY: DeviceSize = 1024;

/// Debug margin of the allocator that test operations run against.
pub const DEBUG_MARGIN: DeviceSize = 32;

/// Requests are clamped to this size, whatever their encoding says.
const MAX_REQUEST_SIZE: DeviceSize = 4 * MIB;

const MAX_ALIGN_LOG2: u8 = 12;

const USAGES: [MemoryUsage; 5] = [
    MemoryUsage::Unknown,
    MemoryUsage::GpuOnly,
    MemoryUsage::CpuOnly,
    MemoryUsage::CpuToGpu,
    MemoryUsage::GpuToCpu,
];

const TYPES: [SuballocationType; 5] = [
    SuballocationType::Unknown,
    SuballocationType::Buffer,
    SuballocationType::ImageUnknown,
    SuballocationType::ImageLinear,
    SuballocationType::ImageOptimal,
];

/// Number of defined `AllocationCreateFlags` bits.
const FLAG_COUNT: usize = 9;

/// An allocation request of a test operation.
///
/// Fields are raw numbers so that any encoding decodes into a request; they
/// are interpreted, and clamped where needed, when the request is made.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Request {
    pub size: u64,
    pub align_log2: u8,
    /// Index into the memory usages.
    pub usage: u8,
    /// Raw `AllocationCreateFlags` bits.
    pub flags: u32,
    /// Index into the non-free suballocation types.
    pub ty: u8,
    pub memory_type_bits: u32,
    /// 0: no preference, 1: prefers dedicated, 2: requires dedicated.
    pub dedicated: u8,
    /// Key of the pool to allocate from, if it exists.
    pub pool: Option<u8>,
}

impl Request {
    /// A plain request of `size` bytes.
    pub fn new(size: u64) -> Self {
        Request {
            size,
            memory_type_bits: u32::MAX,
            ..Request::default()
        }
    }

    pub fn with_flags(mut self, flags: AllocationCreateFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    pub fn with_usage(mut self, usage: MemoryUsage) -> Self {
        self.usage = USAGES.iter().position(|u| *u == usage).unwrap() as u8;
        self
    }

    pub fn in_pool(mut self, pool: u8) -> Self {
        self.pool = Some(pool);
        self
    }

    fn requirements(&self) -> MemoryRequirements {
        MemoryRequirements {
            size: self.size.clamp(1, MAX_REQUEST_SIZE),
            alignment: 1 << (self.align_log2 % (MAX_ALIGN_LOG2 + 1)),
            memory_type_bits: self.memory_type_bits,
            requires_dedicated: self.dedicated % 3 == 2,
            prefers_dedicated: self.dedicated % 3 == 1,
        }
    }

    fn flags(&self) -> AllocationCreateFlags {
        AllocationCreateFlags::from_bits_truncate(self.flags)
    }

    fn create_info(&self, pool: Option<PoolId>, user_data: u64) -> AllocationCreateInfo {
        AllocationCreateInfo {
            flags: self.flags(),
            usage: USAGES[usize::from(self.usage) % USAGES.len()],
            pool,
            user_data,
            ..AllocationCreateInfo::default()
        }
    }

    fn suballocation_type(&self) -> SuballocationType {
        TYPES[usize::from(self.ty) % TYPES.len()]
    }

    /// Whether the allocator must reject this request outright.
    fn is_malformed(&self, in_pool: bool) -> bool {
        type F = AllocationCreateFlags;
        let flags = self.flags();
        let strategies =
            flags & (F::STRATEGY_BEST_FIT | F::STRATEGY_WORST_FIT | F::STRATEGY_FIRST_FIT);
        let dedicated_in_pool = in_pool
            && (flags.contains(F::DEDICATED_MEMORY)
                || (self.requirements().requires_dedicated && !flags.contains(F::NEVER_ALLOCATE)));
        flags.contains(F::MAPPED | F::CAN_BECOME_LOST)
            || flags.contains(F::DEDICATED_MEMORY | F::NEVER_ALLOCATE)
            || strategies.bits().count_ones() > 1
            || dedicated_in_pool
    }
}

impl DefaultMutate for Request {
    type DefaultMutate = RequestMutator;
}

/// A mutator for `Request`s with a configurable maximum size.
#[derive(Debug)]
pub struct RequestMutator {
    pub max_size_log2: u32,
}

impl Default for RequestMutator {
    fn default() -> Self {
        Self { max_size_log2: 20 }
    }
}

impl RequestMutator {
    /// Sizes spread evenly over orders of magnitude.
    fn gen_size(&self, ctx: &mut mutatis::Context) -> u64 {
        let log2 = ctx.rng().gen_index(self.max_size_log2 as usize + 1).unwrap();
        1 + ctx.rng().gen_index(1 << log2).unwrap() as u64
    }

    /// Each flag is set with probability 1/4.
    fn gen_flags(ctx: &mut mutatis::Context) -> u32 {
        (0..FLAG_COUNT)
            .filter(|_| ctx.rng().gen_index(4) == Some(0))
            .fold(0, |flags, bit| flags | 1 << bit)
    }

    fn gen_memory_type_bits(ctx: &mut mutatis::Context) -> u32 {
        if ctx.rng().gen_index(4) == Some(0) {
            ctx.rng().gen_u32() & 0xf
        } else {
            u32::MAX
        }
    }
}

impl Mutate<Request> for RequestMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        request: &mut Request,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            request.size = if ctx.shrink() {
                1 + ctx.rng().gen_index(request.size.max(1) as usize).unwrap() as u64
            } else {
                self.gen_size(ctx)
            };
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max = if ctx.shrink() {
                request.align_log2 % (MAX_ALIGN_LOG2 + 1)
            } else {
                MAX_ALIGN_LOG2
            };
            request.align_log2 = ctx.rng().gen_index(usize::from(max) + 1).unwrap() as u8;
            Ok(())
        })?;

        // Toggle a flag. While shrinking, only clear flags.
        c.mutation(|ctx| {
            let bit = 1 << ctx.rng().gen_index(FLAG_COUNT).unwrap();
            if ctx.shrink() {
                request.flags &= !bit;
            } else {
                request.flags ^= bit;
            }
            Ok(())
        })?;

        if !c.shrink() {
            c.mutation(|ctx| {
                request.usage = ctx.rng().gen_index(USAGES.len()).unwrap() as u8;
                Ok(())
            })?;
            c.mutation(|ctx| {
                request.ty = ctx.rng().gen_index(TYPES.len()).unwrap() as u8;
                Ok(())
            })?;
            c.mutation(|ctx| {
                request.memory_type_bits = Self::gen_memory_type_bits(ctx);
                Ok(())
            })?;
            c.mutation(|ctx| {
                request.dedicated = ctx.rng().gen_index(3).unwrap() as u8;
                Ok(())
            })?;
        }

        // Move the request in or out of a pool.
        c.mutation(|ctx| {
            request.pool = match request.pool {
                Some(_) => None,
                None if ctx.shrink() => None,
                None => Some(ctx.rng().gen_index(4).unwrap() as u8),
            };
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Request> for RequestMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Request> {
        let size = self.gen_size(ctx);
        Ok(Request {
            size,
            align_log2: ctx.rng().gen_index(usize::from(MAX_ALIGN_LOG2) + 1).unwrap() as u8,
            usage: ctx.rng().gen_index(USAGES.len()).unwrap() as u8,
            flags: Self::gen_flags(ctx),
            ty: ctx.rng().gen_index(TYPES.len()).unwrap() as u8,
            memory_type_bits: Self::gen_memory_type_bits(ctx),
            dedicated: if ctx.rng().gen_index(8) == Some(0) {
                1 + ctx.rng().gen_index(2).unwrap() as u8
            } else {
                0
            },
            pool: if ctx.rng().gen_index(4) == Some(0) {
                Some(ctx.rng().gen_index(4).unwrap() as u8)
            } else {
                None
            },
        })
    }
}

/// A test operation.
#[derive(Clone, Debug, PartialEq, Eq, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Allocate {
        id: u32,
        request: Request,
    },
    Free {
        id: u32,
    },
    Map {
        id: u32,
    },
    Unmap {
        id: u32,
    },
    Touch {
        id: u32,
    },
    AdvanceFrame {
        frames: u8,
    },
    CreatePool {
        pool: u8,
        memory_type: u8,
        block_size_kib: u16,
        min_blocks: u8,
        max_blocks: u8,
        frame_in_use_count: u8,
        ignore_granularity: bool,
    },
    DestroyPool {
        pool: u8,
    },
    MakePoolAllocationsLost {
        pool: u8,
    },
}

impl Op {
    fn id_mut(&mut self) -> Option<&mut u32> {
        match self {
            Op::Allocate { id, .. }
            | Op::Free { id }
            | Op::Map { id }
            | Op::Unmap { id }
            | Op::Touch { id } => Some(id),
            Op::AdvanceFrame { .. }
            | Op::CreatePool { .. }
            | Op::DestroyPool { .. }
            | Op::MakePoolAllocationsLost { .. } => None,
        }
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        // Ids and pool keys are drawn from small ranges so that operations
        // find each other.
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Allocate {
                    id: ctx.rng().gen_index(64).unwrap() as u32,
                    request: m::default::<Request>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Allocate {
                    id: ctx.rng().gen_index(64).unwrap() as u32,
                    request: m::default::<Request>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_index(64).unwrap() as u32,
                })
            },
            |ctx| {
                Ok(Op::Map {
                    id: ctx.rng().gen_index(64).unwrap() as u32,
                })
            },
            |ctx| {
                Ok(Op::Unmap {
                    id: ctx.rng().gen_index(64).unwrap() as u32,
                })
            },
            |ctx| {
                Ok(Op::Touch {
                    id: ctx.rng().gen_index(64).unwrap() as u32,
                })
            },
            |ctx| {
                Ok(Op::AdvanceFrame {
                    frames: ctx.rng().gen_index(4).unwrap() as u8,
                })
            },
            |ctx| {
                Ok(Op::CreatePool {
                    pool: ctx.rng().gen_index(4).unwrap() as u8,
                    memory_type: ctx.rng().gen_index(5).unwrap() as u8,
                    block_size_kib: if ctx.rng().gen_bool() {
                        0
                    } else {
                        (ctx.rng().gen_index(4096).unwrap() + 1) as u16
                    },
                    min_blocks: ctx.rng().gen_index(3).unwrap() as u8,
                    max_blocks: ctx.rng().gen_index(4).unwrap() as u8,
                    frame_in_use_count: ctx.rng().gen_index(3).unwrap() as u8,
                    ignore_granularity: ctx.rng().gen_bool(),
                })
            },
            |ctx| {
                Ok(Op::DestroyPool {
                    pool: ctx.rng().gen_index(4).unwrap() as u8,
                })
            },
            |ctx| {
                Ok(Op::MakePoolAllocationsLost {
                    pool: ctx.rng().gen_index(4).unwrap() as u8,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Allocate { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                if let Some(id) = ops.ops[op_index].id_mut() {
                    *id = new_id;
                }
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Map and later unmap an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let map_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(map_index, Op::Map { id });
                    let unmap_index =
                        map_index + 1 + ctx.rng().gen_index(ops.ops.len() - map_index).unwrap();
                    ops.ops.insert(unmap_index, Op::Unmap { id });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation. Returns `false` if there was none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// The configuration of the allocator that [`Ops::run`] creates.
    pub fn allocator_create_info() -> AllocatorCreateInfo {
        AllocatorCreateInfo {
            frame_in_use_count: 1,
            heap_size_limits: vec![Some(HEAP_SIZE * 3 / 4), None],
            debug_margin: DEBUG_MARGIN,
            ..AllocatorCreateInfo::default()
        }
    }

    /// Run these test operations against a fresh allocator over host memory,
    /// then check that every memory object was returned to the device.
    pub fn run(&self) -> Result<(), String> {
        let device = HostMemoryDevice::discrete(HEAP_SIZE, BUFFER_IMAGE_GRANULARITY);
        let allocator = Allocator::<_, SingleThreadedLock>::new(
            device.clone(),
            Self::allocator_create_info(),
        )
        .map_err(|e| format!("failed to create allocator: {e}"))?;

        self.run_with_allocator(&allocator, DEBUG_MARGIN)?;

        drop(allocator);
        ensure!(
            device.live_objects() == 0,
            "{} memory objects outlived the allocator",
            device.live_objects()
        );
        Ok(())
    }

    /// Run these test operations with the given allocator, whose debug margin
    /// is `debug_margin`. Everything allocated is freed again before
    /// returning.
    pub fn run_with_allocator<L>(
        &self,
        allocator: &Allocator<HostMemoryDevice, L>,
        debug_margin: DeviceSize,
    ) -> Result<(), String>
    where
        L: LockingMechanism,
    {
        log::debug!("========== Running test operations ==========");

        let mut runner = Runner {
            allocator,
            debug_margin,
            live: BTreeMap::new(),
            pools: BTreeMap::new(),
        };

        for op in &self.ops {
            log::debug!("op: {op:?}");
            runner.apply(op)?;
            runner.check_consistency()?;
        }

        runner.finish()
    }
}

/// A currently-live allocation.
struct LiveAlloc {
    allocation: Allocation<u64>,
    /// Where the allocation was placed. Nothing moves allocations, so this
    /// stays valid until it is freed or lost.
    memory: u64,
    offset: DeviceSize,
    ty: SuballocationType,
    /// Buffer-image granularity its placement had to respect.
    granularity: DeviceSize,
    /// Host pointer to the allocation while it is mapped.
    ptr: Option<NonNull<u8>>,
    /// Outstanding `map` calls.
    map_count: u32,
    /// Byte the allocation is filled with once it has been mapped.
    pattern: u8,
    filled: bool,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveAlloc")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("size", &self.allocation.size())
            .field("ty", &self.ty)
            .field("dedicated", &self.allocation.is_dedicated())
            .field("lost", &self.allocation.is_lost())
            .field("map_count", &self.map_count)
            .finish()
    }
}

impl LiveAlloc {
    fn bytes(&self) -> Option<&[u8]> {
        let ptr = self.ptr?;
        // Safety: the pointer is mapped and covers the whole allocation.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.allocation.size() as usize) })
    }

    fn fill(&mut self) {
        if let Some(ptr) = self.ptr {
            // Safety: as above; the overlap checks make sure no other live
            // allocation aliases these bytes.
            unsafe { ptr.as_ptr().write_bytes(self.pattern, self.allocation.size() as usize) };
            self.filled = true;
        }
    }

    fn check_pattern(&self, id: u32) -> Result<(), String> {
        if !self.filled || self.allocation.is_lost() {
            return Ok(());
        }
        if let Some(bytes) = self.bytes() {
            ensure!(
                bytes.iter().all(|b| *b == self.pattern),
                "contents of allocation id{id} were overwritten: {self:?}"
            );
        }
        Ok(())
    }

    fn range_end(&self) -> DeviceSize {
        self.offset + self.allocation.size()
    }
}

struct Runner<'a, L: LockingMechanism> {
    allocator: &'a Allocator<HostMemoryDevice, L>,
    debug_margin: DeviceSize,
    live: BTreeMap<u32, LiveAlloc>,
    /// Live pools and whether they ignore buffer-image granularity.
    pools: BTreeMap<u8, (PoolId, bool)>,
}

impl<L: LockingMechanism> Runner<'_, L> {
    fn apply(&mut self, op: &Op) -> Result<(), String> {
        match *op {
            Op::Allocate { id, request } => self.allocate(id, &request),
            Op::Free { id } => match self.live.remove(&id) {
                Some(live) => self.free(id, live),
                None => Ok(()),
            },
            Op::Map { id } => self.map(id),
            Op::Unmap { id } => self.unmap(id),
            Op::Touch { id } => self.touch(id),
            Op::AdvanceFrame { frames } => {
                let frame = self
                    .allocator
                    .current_frame_index()
                    .saturating_add(u32::from(frames))
                    .min(FRAME_INDEX_LOST - 1);
                self.allocator
                    .set_current_frame_index(frame)
                    .map_err(|e| format!("failed to advance to frame {frame}: {e}"))
            }
            Op::CreatePool {
                pool,
                memory_type,
                block_size_kib,
                min_blocks,
                max_blocks,
                frame_in_use_count,
                ignore_granularity,
            } => {
                let info = PoolCreateInfo {
                    memory_type_index: u32::from(memory_type % 5),
                    flags: if ignore_granularity {
                        PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY
                    } else {
                        PoolCreateFlags::empty()
                    },
                    block_size: DeviceSize::from(block_size_kib) * KIB,
                    min_block_count: usize::from(min_blocks % 4),
                    max_block_count: usize::from(max_blocks % 4),
                    frame_in_use_count: u32::from(frame_in_use_count % 4),
                    name: None,
                };
                self.create_pool(pool, &info)
            }
            Op::DestroyPool { pool } => self.destroy_pool(pool),
            Op::MakePoolAllocationsLost { pool } => self.make_pool_allocations_lost(pool),
        }
    }

    fn allocate(&mut self, id: u32, request: &Request) -> Result<(), String> {
        if let Some(old) = self.live.remove(&id) {
            self.free(id, old)?;
        }

        let pool = request.pool.and_then(|key| self.pools.get(&key).copied());
        let granularity = match pool {
            Some((_, true)) => 1,
            _ => BUFFER_IMAGE_GRANULARITY,
        };
        let pool = pool.map(|(pool, _)| pool);
        let requirements = request.requirements();
        let info = request.create_info(pool, u64::from(id));
        let malformed = request.is_malformed(pool.is_some());

        let allocation = match self.allocator.allocate(
            &requirements,
            &info,
            request.suballocation_type(),
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                log::debug!("allocation id{id} failed: {e}");
                let rejected = matches!(
                    e,
                    AllocationError::InvalidArgument(_) | AllocationError::InvalidStrategy
                );
                ensure!(
                    rejected == malformed,
                    "request {request:?} failed with unexpected error: {e}"
                );
                ensure!(
                    !matches!(
                        e,
                        AllocationError::UnknownPool | AllocationError::FeatureNotPresent(_)
                    ),
                    "request {request:?} failed with unexpected error: {e}"
                );
                return Ok(());
            }
        };
        ensure!(!malformed, "malformed request {request:?} was accepted");

        let flags = info.flags;
        let mti = allocation.memory_type_index();
        ensure!(
            allocation.size() == requirements.size,
            "allocation size {} differs from requested size {}",
            allocation.size(),
            requirements.size
        );
        ensure!(
            allocation.offset() % requirements.alignment == 0,
            "offset {} is not aligned to {}",
            allocation.offset(),
            requirements.alignment
        );
        let allowed_types = match requirements.memory_type_bits {
            0 => u32::MAX,
            bits => bits,
        };
        ensure!(
            allowed_types & (1 << mti) != 0,
            "memory type {mti} is not in {:#x}",
            requirements.memory_type_bits
        );
        ensure!(allocation.pool() == pool, "allocation is in the wrong pool");
        ensure!(
            allocation.user_data() == u64::from(id),
            "user data was not carried over"
        );
        if pool.is_some() || flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            ensure!(
                !allocation.is_dedicated(),
                "pool or never-allocate requests must not get dedicated memory"
            );
        }
        if requirements.requires_dedicated || flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
        {
            ensure!(
                allocation.is_dedicated(),
                "dedicated request was placed in a block"
            );
        }
        if !allocation.is_dedicated() {
            ensure!(
                allocation.can_become_lost()
                    == flags.contains(AllocationCreateFlags::CAN_BECOME_LOST),
                "evictability does not match the request"
            );
        }

        let Some(placed) = self.allocator.allocation_info(&allocation) else {
            return Err(format!("fresh allocation id{id} is already lost"));
        };
        let Some(object_size) = self.allocator.device().object_size(placed.memory) else {
            return Err(format!("allocation id{id} lives in freed memory {}", placed.memory));
        };
        ensure!(placed.offset == allocation.offset(), "offsets disagree");
        ensure!(
            placed.offset + placed.size <= object_size,
            "allocation id{id} extends past its memory object"
        );
        if allocation.is_dedicated() {
            ensure!(
                placed.offset == 0 && placed.size == object_size,
                "dedicated allocation id{id} does not fill its memory object"
            );
        } else {
            ensure!(
                placed.offset >= self.debug_margin
                    && placed.offset + placed.size + self.debug_margin <= object_size,
                "allocation id{id} leaves no debug margin at the block boundaries"
            );
        }

        let host_visible = self.is_host_visible(mti);
        if flags.contains(AllocationCreateFlags::MAPPED) && host_visible {
            ensure!(
                placed.mapped.is_some() && allocation.is_mapped(),
                "allocation id{id} requested as mapped is not mapped"
            );
        }

        let mut live = LiveAlloc {
            allocation,
            memory: placed.memory,
            offset: placed.offset,
            ty: request.suballocation_type(),
            granularity,
            ptr: placed.mapped,
            map_count: 0,
            pattern: (id as u8) ^ 0xa5,
            filled: false,
        };
        log::debug!("new allocation: id{id} -> {live:?}");
        self.check_not_overlapping(id, &live)?;
        live.fill();
        self.live.insert(id, live);
        Ok(())
    }

    fn check_not_overlapping(&self, id: u32, new: &LiveAlloc) -> Result<(), String> {
        for (other_id, other) in &self.live {
            if other.allocation.is_lost() || other.memory != new.memory {
                continue;
            }
            let (first, second) = if other.offset < new.offset {
                (other, new)
            } else {
                (new, other)
            };
            ensure!(
                first.range_end() + self.debug_margin <= second.offset,
                "allocations id{id} and id{other_id} overlap or violate the debug margin: {new:?} {other:?}"
            );

            let granularity = first.granularity.max(second.granularity);
            if granularity > 1 && first.ty.conflicts_with(second.ty) {
                ensure!(
                    (first.range_end() - 1) / granularity != second.offset / granularity,
                    "allocations id{id} and id{other_id} of conflicting types share a page"
                );
            }
        }
        Ok(())
    }

    fn free(&mut self, id: u32, mut live: LiveAlloc) -> Result<(), String> {
        log::debug!("freeing id{id} -> {live:?}");
        live.check_pattern(id)?;
        while live.map_count > 0 {
            self.allocator
                .unmap(&mut live.allocation)
                .map_err(|e| format!("failed to unmap id{id} before freeing it: {e}"))?;
            live.map_count -= 1;
        }
        self.allocator.free(live.allocation);
        Ok(())
    }

    fn map(&mut self, id: u32) -> Result<(), String> {
        let host_visible = match self.live.get(&id) {
            Some(live) => self.is_host_visible(live.allocation.memory_type_index()),
            None => return Ok(()),
        };
        let Some(live) = self.live.get_mut(&id) else {
            return Ok(());
        };

        match self.allocator.map(&mut live.allocation) {
            Ok(ptr) => {
                ensure!(
                    !live.allocation.can_become_lost(),
                    "evictable allocation id{id} was mapped"
                );
                if let Some(previous) = live.ptr {
                    ensure!(
                        previous == ptr,
                        "mapping id{id} again moved it from {previous:p} to {ptr:p}"
                    );
                }
                live.ptr = Some(ptr);
                live.map_count += 1;
                if live.filled {
                    live.check_pattern(id)?;
                } else {
                    live.fill();
                }
            }
            Err(MapError::Lost) => {
                ensure!(live.allocation.is_lost(), "live allocation id{id} reported lost")
            }
            Err(MapError::EvictableAllocation) => ensure!(
                live.allocation.can_become_lost(),
                "allocation id{id} wrongly reported as evictable"
            ),
            Err(MapError::Device(DeviceError::MemoryMapFailed)) => ensure!(
                !host_visible,
                "mapping host-visible allocation id{id} failed"
            ),
            Err(e) => return Err(format!("unexpected error mapping id{id}: {e}")),
        }
        Ok(())
    }

    fn unmap(&mut self, id: u32) -> Result<(), String> {
        let Some(live) = self.live.get_mut(&id) else {
            return Ok(());
        };
        match self.allocator.unmap(&mut live.allocation) {
            Ok(()) => {
                ensure!(live.map_count > 0, "unmapped id{id}, which was not mapped");
                live.check_pattern(id)?;
                live.map_count -= 1;
                if !live.allocation.is_mapped() {
                    live.ptr = None;
                }
            }
            Err(MapError::NotMapped) => ensure!(
                live.map_count == 0,
                "unmapping id{id}, mapped {} times, failed",
                live.map_count
            ),
            Err(e) => return Err(format!("unexpected error unmapping id{id}: {e}")),
        }
        Ok(())
    }

    fn touch(&mut self, id: u32) -> Result<(), String> {
        let Some(live) = self.live.get(&id) else {
            return Ok(());
        };
        let was_lost = live.allocation.is_lost();
        let touched = self.allocator.touch_allocation(&live.allocation);
        ensure!(
            touched != was_lost,
            "touching id{id} returned {touched}, but its lost state was {was_lost}"
        );
        if touched {
            ensure!(
                live.allocation.last_use_frame() == self.allocator.current_frame_index(),
                "touching id{id} did not record the current frame"
            );
        }
        Ok(())
    }

    fn create_pool(&mut self, key: u8, info: &PoolCreateInfo) -> Result<(), String> {
        self.destroy_pool(key)?;

        let type_count = self.allocator.memory_properties().memory_types.len();
        let malformed = info.memory_type_index as usize >= type_count
            || (info.max_block_count != 0 && info.min_block_count > info.max_block_count);

        match self.allocator.create_pool(info) {
            Ok(pool) => {
                ensure!(!malformed, "malformed pool {info:?} was created");
                let stats = self
                    .allocator
                    .pool_stats(pool)
                    .map_err(|e| format!("no stats for new pool: {e}"))?;
                ensure!(
                    stats.block_count == info.min_block_count && stats.allocation_count == 0,
                    "new pool has unexpected stats {stats:?}"
                );

                let name = format!("pool{key}");
                self.allocator
                    .set_pool_name(pool, Some(&name))
                    .map_err(|e| format!("failed to name pool: {e}"))?;
                ensure!(
                    self.allocator.pool_name(pool) == Ok(Some(name)),
                    "pool name was not kept"
                );
                let ignores_granularity = info
                    .flags
                    .contains(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY);
                self.pools.insert(key, (pool, ignores_granularity));
            }
            Err(e) => {
                log::debug!("creating pool {info:?} failed: {e}");
                if malformed {
                    ensure!(
                        matches!(e, AllocationError::InvalidArgument(_)),
                        "malformed pool {info:?} failed with unexpected error: {e}"
                    );
                } else {
                    ensure!(
                        matches!(
                            e,
                            AllocationError::OutOfDeviceMemory | AllocationError::TooManyObjects
                        ),
                        "pool {info:?} failed with unexpected error: {e}"
                    );
                }
            }
        }
        Ok(())
    }

    fn destroy_pool(&mut self, key: u8) -> Result<(), String> {
        let Some((pool, _)) = self.pools.remove(&key) else {
            return Ok(());
        };

        let ids: Vec<u32> = self
            .live
            .iter()
            .filter(|(_, live)| live.allocation.pool() == Some(pool))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(live) = self.live.remove(&id) {
                self.free(id, live)?;
            }
        }

        self.allocator
            .destroy_pool(pool)
            .map_err(|e| format!("failed to destroy pool {key}: {e}"))?;
        ensure!(
            self.allocator.pool_stats(pool) == Err(AllocationError::UnknownPool),
            "destroyed pool {key} still has stats"
        );
        Ok(())
    }

    fn make_pool_allocations_lost(&mut self, key: u8) -> Result<(), String> {
        let Some(&(pool, _)) = self.pools.get(&key) else {
            return Ok(());
        };
        let in_pool_and_live = |runner: &Self| -> Vec<u32> {
            runner
                .live
                .iter()
                .filter(|(_, live)| {
                    live.allocation.pool() == Some(pool) && !live.allocation.is_lost()
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let before = in_pool_and_live(self);
        let count = self
            .allocator
            .make_pool_allocations_lost(pool)
            .map_err(|e| format!("failed to make allocations of pool {key} lost: {e}"))?;
        let after = in_pool_and_live(self);

        ensure!(
            before.len() - after.len() == count,
            "{count} allocations of pool {key} reported lost, but {} were",
            before.len() - after.len()
        );
        for id in &before {
            let live = &self.live[id];
            if live.allocation.is_lost() {
                ensure!(
                    live.allocation.can_become_lost(),
                    "allocation id{id} was lost without being evictable"
                );
            }
        }
        Ok(())
    }

    fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.allocator.memory_properties().memory_types[memory_type_index as usize]
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Properties that hold between any two operations.
    fn check_consistency(&self) -> Result<(), String> {
        self.allocator
            .validate()
            .map_err(|e| format!("allocator failed validation: {e}"))?;

        let stats = self.allocator.calculate_stats();
        let not_lost = self
            .live
            .values()
            .filter(|live| !live.allocation.is_lost())
            .count();
        ensure!(
            stats.total.allocation_count as usize == not_lost,
            "stats count {} allocations, but {not_lost} are live",
            stats.total.allocation_count
        );

        let properties = self.allocator.memory_properties();
        for heap in 0..properties.memory_heaps.len() as u32 {
            let expected: DeviceSize = self
                .live
                .values()
                .filter(|live| {
                    properties.memory_types[live.allocation.memory_type_index() as usize]
                        .heap_index
                        == heap
                })
                .map(|live| live.allocation.size())
                .sum();
            let Some(budget) = self.allocator.budget(heap) else {
                return Err(format!("no budget for heap {heap}"));
            };
            ensure!(
                budget.allocation_bytes == expected,
                "heap {heap} accounts {} allocation bytes, expected {expected}",
                budget.allocation_bytes
            );
        }
        Ok(())
    }

    /// Frees everything and destroys every pool.
    fn finish(mut self) -> Result<(), String> {
        let live = std::mem::take(&mut self.live);
        for (id, live) in live {
            self.free(id, live)?;
        }
        let keys: Vec<u8> = self.pools.keys().copied().collect();
        for key in keys {
            self.destroy_pool(key)?;
        }
        self.check_consistency()?;

        let stats = self.allocator.calculate_stats();
        ensure!(
            stats.total.allocation_count == 0 && stats.total.used_bytes == 0,
            "allocations remain after freeing everything: {:?}",
            stats.total
        );
        ensure!(
            self.allocator.device().mapped_objects() == 0,
            "{} memory objects are still mapped after freeing everything",
            self.allocator.device().mapped_objects()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_suballoc::ParkingLotLock;
    use mutatis::check::{Check, CheckError, CheckFailure};

    fn alloc(id: u32, request: Request) -> Op {
        Op::Allocate { id, request }
    }

    fn create_pool(pool: u8, memory_type: u8, min_blocks: u8, max_blocks: u8) -> Op {
        Op::CreatePool {
            pool,
            memory_type,
            block_size_kib: 256,
            min_blocks,
            max_blocks,
            frame_in_use_count: 0,
            ignore_granularity: false,
        }
    }

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        type F = AllocationCreateFlags;
        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple allocate/free pair.
            Ops::new([alloc(0, Request::new(256)), Op::Free { id: 0 }]),
            // Persistently mapped allocations next to each other.
            Ops::new([
                alloc(
                    0,
                    Request::new(1000)
                        .with_usage(MemoryUsage::CpuToGpu)
                        .with_flags(F::MAPPED),
                ),
                alloc(
                    1,
                    Request::new(3000)
                        .with_usage(MemoryUsage::CpuToGpu)
                        .with_flags(F::MAPPED),
                ),
                Op::Free { id: 0 },
            ]),
            // Explicit map and unmap.
            Ops::new([
                alloc(0, Request::new(4096).with_usage(MemoryUsage::CpuOnly)),
                Op::Map { id: 0 },
                Op::Map { id: 0 },
                Op::Unmap { id: 0 },
                Op::Unmap { id: 0 },
                Op::Unmap { id: 0 },
            ]),
            // Evictable allocations in a pool, made lost.
            Ops::new([
                create_pool(0, 0, 1, 1),
                alloc(0, Request::new(64 << 10).with_flags(F::CAN_BECOME_LOST).in_pool(0)),
                Op::AdvanceFrame { frames: 2 },
                Op::MakePoolAllocationsLost { pool: 0 },
                Op::Touch { id: 0 },
                Op::Free { id: 0 },
            ]),
            // Eviction by a later allocation.
            Ops::new([
                create_pool(1, 2, 1, 1),
                alloc(
                    0,
                    Request::new(200 << 10).with_flags(F::CAN_BECOME_LOST).in_pool(1),
                ),
                Op::AdvanceFrame { frames: 3 },
                alloc(
                    1,
                    Request::new(200 << 10)
                        .with_flags(F::CAN_MAKE_OTHER_LOST)
                        .in_pool(1),
                ),
                Op::DestroyPool { pool: 1 },
            ]),
            // Dedicated memory.
            Ops::new([
                alloc(0, Request::new(3 << 20)),
                alloc(1, Request::new(512).with_flags(F::DEDICATED_MEMORY)),
            ]),
        ];

        match Check::new().iters(5_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| ops.run(),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn seed_scenarios_pass() {
        let _ = env_logger::try_init();

        type F = AllocationCreateFlags;
        let ops = Ops::new([
            create_pool(0, 1, 2, 0),
            alloc(0, Request::new(100).in_pool(0)),
            alloc(1, Request::new(100).with_flags(F::MAPPED).in_pool(0)),
            Op::Map { id: 0 },
            alloc(2, Request::new(1 << 20).with_flags(F::STRATEGY_WORST_FIT)),
            alloc(3, Request::new(10).with_flags(F::STRATEGY_FIRST_FIT)),
            Op::Unmap { id: 0 },
            Op::Free { id: 2 },
        ]);
        ops.run().unwrap();
    }

    #[test]
    fn malformed_requests_are_rejected() {
        type F = AllocationCreateFlags;
        let ops = Ops::new([
            alloc(0, Request::new(64).with_flags(F::MAPPED | F::CAN_BECOME_LOST)),
            alloc(
                1,
                Request::new(64).with_flags(F::STRATEGY_BEST_FIT | F::STRATEGY_FIRST_FIT),
            ),
            alloc(2, Request::new(64).with_flags(F::DEDICATED_MEMORY | F::NEVER_ALLOCATE)),
            create_pool(0, 4, 0, 0),
            create_pool(1, 0, 3, 2),
        ]);
        ops.run().unwrap();
    }

    #[test]
    fn heap_exhaustion_is_survivable() {
        // More than the device-local heap limit: later requests spill over to
        // the host heap, and freeing makes room again.
        let mut ops = Vec::new();
        for id in 0..40 {
            ops.push(alloc(id, Request::new(900 << 10)));
        }
        for id in 0..40 {
            ops.push(Op::Free { id });
        }
        ops.push(alloc(0, Request::new(900 << 10)));
        Ops::new(ops).run().unwrap();
    }

    #[test]
    fn aligned_requests_just_over_a_pool_block_leave_no_empty_blocks() {
        // Fits the block between two margins, but not after aligning its
        // start past the leading margin.
        let request = Request {
            align_log2: 8,
            ..Request::new(256 * KIB - 2 * DEBUG_MARGIN)
        };
        let mut ops = vec![create_pool(0, 0, 1, 4)];
        for id in 0..3 {
            ops.push(alloc(id, request.in_pool(0)));
        }
        ops.push(alloc(3, Request::new(KIB).in_pool(0)));
        Ops::new(ops).run().unwrap();
    }

    #[test]
    fn shared_between_threads() {
        let _ = env_logger::try_init();

        let device = HostMemoryDevice::discrete(HEAP_SIZE, BUFFER_IMAGE_GRANULARITY);
        let allocator =
            Allocator::<_, ParkingLotLock>::new(device.clone(), Ops::allocator_create_info())
                .unwrap();

        std::thread::scope(|s| {
            for thread in 0..4u64 {
                let allocator = &allocator;
                s.spawn(move || {
                    let requirements = MemoryRequirements {
                        size: 4096 + thread * 512,
                        alignment: 256,
                        ..MemoryRequirements::default()
                    };
                    let info = AllocationCreateInfo {
                        usage: MemoryUsage::GpuOnly,
                        ..AllocationCreateInfo::default()
                    };
                    for _ in 0..50 {
                        let allocations: Vec<_> = (0..8)
                            .map(|_| {
                                allocator
                                    .allocate(&requirements, &info, SuballocationType::Buffer)
                                    .unwrap()
                            })
                            .collect();
                        for allocation in allocations {
                            allocator.free(allocation);
                        }
                    }
                });
            }
        });

        allocator.validate().unwrap();
        assert_eq!(allocator.calculate_stats().total.allocation_count, 0);
        drop(allocator);
        assert_eq!(device.live_objects(), 0);
    }
}
