use sysinfo::System;

/// Hard ceiling so a huge box doesn't open hundreds of file handles.
const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct Tune {
    pub workers: usize,
    pub ffmpeg_threads: usize,
}

/// Picks a worker count from core count and free memory.
///
/// Each worker holds a read buffer, a raster and the PNG encoder's scratch
/// space, so roughly four frames of memory per worker.
pub fn auto_tune(buffer_size: usize) -> Tune {
    let cores = num_cpus::get().max(1);
    let avail = available_ram_bytes();

    let per_worker = (buffer_size as u64).saturating_mul(4).max(1);
    // Leave half the free memory to ffmpeg and the page cache.
    let by_ram = ((avail / 2) / per_worker).max(1) as usize;

    let workers = cores.min(by_ram).clamp(1, MAX_WORKERS);
    let ffmpeg_threads = cores.max(1);

    eprintln!(
        "Auto-tune: cores={} avail={}MiB frame={}KiB workers={} ffmpeg_threads={}",
        cores,
        avail / (1024 * 1024),
        buffer_size / 1024,
        workers,
        ffmpeg_threads
    );

    Tune {
        workers,
        ffmpeg_threads,
    }
}

fn available_ram_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tune_stays_within_bounds() {
        let tune = auto_tune(640 * 480);
        assert!(tune.workers >= 1 && tune.workers <= MAX_WORKERS);
        assert!(tune.ffmpeg_threads >= 1);
    }
}
