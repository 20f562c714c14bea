pub mod cd_control;
pub mod cd_drive;
pub mod cdif;
pub mod config;
pub mod cpu;
pub mod crtc;
pub mod device;
pub mod device_list;
pub mod dma;
pub mod emulation_loop;
pub mod error;
pub mod io_bus;
pub mod logging;
pub mod machine;
pub mod memory;
pub mod memory_bus;
pub mod ports;
pub mod scheduler;
pub mod snapshot;
pub mod sound;
pub mod tape;
pub mod utils;

pub use config::Config;
pub use cpu::{Cpu, CpuExecutor, SystemBus};
pub use device::{Device, DeviceId, DeviceKey, DeviceRef};
pub use device_list::DeviceList;
pub use emulation_loop::{EmulationLoop, Emulated, LoopCommand, Pacer};
pub use error::{ConfigError, SnapshotError, StatusError, TapeError};
pub use io_bus::{Connector, IoBus};
pub use machine::{Machine, MachineBuilder};
pub use memory_bus::{MemoryBus, Ram};
pub use scheduler::{EventHandle, Executor, IdleExecutor, Scheduler};
pub use utils::hexdump;
