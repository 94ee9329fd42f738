//! Fault target - maps a text file and keeps faulting its first page
//!
//! Each round drops the page with `MADV_DONTNEED` and reads it again, so every
//! round takes a fresh page fault. With pagetap attached the printed line
//! changes: every byte except newlines is shifted by one.
//!
//! Run with:
//!   cargo run --example fault_target -- /tmp/pagetap-demo.txt
//!   sudo pagetap --comm fault_target --dump-pages

#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::time::Duration;

const PAGE: usize = 4096;

fn main() -> std::io::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "/tmp/pagetap-demo.txt".to_string());

    let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
    let line = b"the quick brown fox jumps over the lazy dog\n";
    let mut page = Vec::with_capacity(PAGE);
    while page.len() + line.len() <= PAGE {
        page.extend_from_slice(line);
    }
    page.resize(PAGE, b'\n');
    file.write_all(&page)?;
    file.sync_all()?;

    // SAFETY: fresh private mapping of a file we own, length one page.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            PAGE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }

    println!("pid {} mapped {path} at {addr:p}", std::process::id());
    for round in 0.. {
        // SAFETY: addr..addr+PAGE is our mapping for the life of the process.
        let bytes = unsafe { std::slice::from_raw_parts(addr.cast::<u8>(), PAGE) };
        let first = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
        println!("[{round}] {}", String::from_utf8_lossy(first));

        // SAFETY: discarding a private mapping only drops our copy of the page.
        if unsafe { libc::madvise(addr, PAGE, libc::MADV_DONTNEED) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    Ok(())
}
