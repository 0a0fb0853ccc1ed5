//! Manual end-to-end smoke test for the remap layer: builds two in-memory
//! devices, activates a dispatcher over them, installs a remap, drives a
//! couple of management operations, and prints the resulting status.
//!
//! This is not a management CLI — there is no wire protocol or argument
//! grammar here, just a fixed sequence of direct calls against the library
//! for manual inspection.

use anyhow::Result;
use sparemap_core::{BlockDevice, Config, Dispatcher, MemBlockDevice};
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::init();

    let primary: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(20_000));
    let spare: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(10_000));

    let dispatcher = Dispatcher::activate(primary, spare, 64, 64, 9_000, Config::default())?;

    println!("activated: {:?}", dispatcher.status());

    let mut sector = vec![0u8; 512];
    sector[..13].copy_from_slice(b"TEST_DATA_123");
    dispatcher.remap_to(100, 5000, 1)?;
    dispatcher.write(100, &sector)?;
    dispatcher.save()?;

    let status = dispatcher.status();
    println!("after remap + save: {status:?}");

    println!("ping: {}", dispatcher.ping());

    dispatcher.shutdown();
    Ok(())
}
