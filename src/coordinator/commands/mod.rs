pub mod device_scan;
pub mod read_registers;
pub mod register_scan;

pub use device_scan::{DeviceProbe, DeviceScan};
pub use read_registers::ReadRegisters;
pub use register_scan::{RegisterScan, ScanResult};
