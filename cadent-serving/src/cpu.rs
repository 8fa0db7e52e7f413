//! CPU affinity for latency-sensitive executor threads.

#[cfg(target_os = "linux")]
pub(crate) fn pin_current_thread(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!(
                "failed to pin thread to cpu {core}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_current_thread(core: usize) {
    log::warn!("cpu pinning is not supported on this platform (requested cpu {core})");
}
