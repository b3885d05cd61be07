//! Memory budget, block pool and pressure handling

pub mod manager;
pub mod pool;

pub use manager::{
    Allocation, AllocationInfo, AllocationOptions, AllocationPriority, MemoryError, MemoryManager,
    MemoryStats, PressureState, ResidentModel,
};
pub use pool::{Block, ClassStats, PoolStats, ResourcePool, SizeClass};
