//! Driver host: runs RAM-backed block and framebuffer drivers under the
//! fabric manager and serves each namespace over TCP for 9P clients.
//!
//! Listen addresses come from FABRIC9_BLOCK_ADDR / FABRIC9_FB_ADDR
//! (defaults 127.0.0.1:5640 and 127.0.0.1:5641).

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use fabric9::block::BlockDriver;
use fabric9::device::{MemoryDisk, MemoryDisplay};
use fabric9::fb::driver::{screen_from_boot_info, BootInfo, FramebufferDriver};
use fabric9::{
    Capability, DriverConfig, DriverFactory, DriverHandle, DriverManager, Server,
};

const BLOCK_SECTORS: u64 = 32 * 1024; // 16 MiB RAM disk

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    log::info!("fabric9 driver host v{}", fabric9::VERSION);

    let factory = Arc::new(DriverFactory::new());

    factory.register(
        "block",
        Box::new(|config: &DriverConfig| {
            let backend = Arc::new(MemoryDisk::new(1, BLOCK_SECTORS));
            let driver = Arc::new(BlockDriver::new(&config.name, backend));
            Ok(DriverHandle::new(driver.clone())
                .with_device(driver.clone())
                .with_files(driver))
        }),
    )?;

    factory.register(
        "fb",
        Box::new(|config: &DriverConfig| {
            let info = BootInfo {
                addr: 0xE000_0000,
                width: 1024,
                height: 768,
                pitch: 4096,
                depth: 32,
            };
            let display = Arc::new(MemoryDisplay::new(info.pitch * info.height));
            let screen = screen_from_boot_info("screen0", &info, display)?;
            let driver = Arc::new(FramebufferDriver::new(&config.name));
            driver.add_screen(Arc::new(screen))?;
            Ok(DriverHandle::new(driver.clone())
                .with_device(driver.clone())
                .with_files(driver))
        }),
    )?;

    let manager = Arc::new(DriverManager::new(factory));

    manager.start_driver(
        "block",
        &DriverConfig::new(
            "block0",
            Capability::FILE_SYSTEM | BlockDriver::REQUIRED_CAPS,
            "/dev/sd",
        ),
    )?;
    manager.start_driver(
        "fb",
        &DriverConfig::new(
            "fb0",
            Capability::FILE_SYSTEM | FramebufferDriver::REQUIRED_CAPS,
            "/dev/draw",
        ),
    )?;

    let block_addr =
        std::env::var("FABRIC9_BLOCK_ADDR").unwrap_or_else(|_| "127.0.0.1:5640".into());
    let fb_addr = std::env::var("FABRIC9_FB_ADDR").unwrap_or_else(|_| "127.0.0.1:5641".into());

    let handles = vec![
        listen(&manager, "block0", &block_addr)?,
        listen(&manager, "fb0", &fb_addr)?,
    ];
    for handle in handles {
        let _ = handle.join();
    }

    manager.stop_all()?;
    Ok(())
}

/// Accept loop for one driver's namespace: one serving thread per
/// connection, each with its own session.
fn listen(
    manager: &Arc<DriverManager>,
    driver: &str,
    addr: &str,
) -> Result<thread::JoinHandle<()>, Box<dyn std::error::Error>> {
    let handle = manager
        .get(driver)
        .ok_or_else(|| format!("driver {} not running", driver))?;
    let files = handle
        .files()
        .ok_or_else(|| format!("driver {} exports no files", driver))?
        .clone();

    let listener = TcpListener::bind(addr)?;
    log::info!("serving {} at {}", driver, addr);

    let name = driver.to_string();
    Ok(thread::spawn(move || {
        for conn in listener.incoming() {
            let mut conn = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!("{}: accept failed: {}", name, err);
                    continue;
                }
            };
            let files = files.clone();
            let name = name.clone();
            thread::spawn(move || {
                let server = Server::new(files);
                if let Err(err) = server.serve(&mut conn) {
                    log::warn!("{}: connection closed: {}", name, err);
                }
            });
        }
    }))
}
