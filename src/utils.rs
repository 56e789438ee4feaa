use std::time::Duration;

pub const KB: usize = 1024;
pub const MB: usize = KB * 1024;
pub const GB: usize = MB * 1024;

pub const BITS_PER_WORD: usize = std::mem::size_of::<usize>() * 8;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align - 1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Rounds `x` up to a multiple of `n`, `n` does not have to be a power of two.
#[inline(always)]
pub const fn round_up(x: usize, n: usize) -> usize {
    ((x + n - 1) / n) * n
}

#[cfg(unix)]
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4 * KB
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4 * KB
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}KiB", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}MiB", msize)
        } else {
            write!(f, "{:.1}GiB", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

pub struct FormattedDuration {
    pub duration: Duration,
}

impl std::fmt::Display for FormattedDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let nanos = self.duration.as_nanos();
        if nanos < 1_000 {
            write!(f, "{}ns", nanos)
        } else if nanos < 1_000_000 {
            write!(f, "{:.3}us", nanos as f64 / 1_000.0)
        } else if nanos < 1_000_000_000 {
            write!(f, "{:.3}ms", nanos as f64 / 1_000_000.0)
        } else {
            write!(f, "{:.3}s", nanos as f64 / 1_000_000_000.0)
        }
    }
}

pub fn formatted_duration(duration: Duration) -> FormattedDuration {
    FormattedDuration { duration }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_down(15, 8), 8);
        assert!(is_aligned(128, 128));
        assert!(!is_aligned(129, 128));
        assert_eq!(round_up(1025, 128), 1152);
    }

    #[test]
    fn size_formatting() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2 * KB).to_string(), "2.0KiB");
        assert_eq!(formatted_size(3 * MB + MB / 2).to_string(), "3.5MiB");
        assert_eq!(formatted_size(2 * GB).to_string(), "2.0GiB");
    }
}
