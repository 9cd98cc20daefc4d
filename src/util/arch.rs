#[derive(Debug, PartialEq)]
pub enum Architecture {
    Arm64,
    X86,
    PowerPc64,
}

#[cfg(target_arch = "aarch64")]
pub fn architecture() -> Architecture {
    Architecture::Arm64
}

#[cfg(target_arch = "x86_64")]
pub fn architecture() -> Architecture {
    Architecture::X86
}

#[cfg(target_arch = "powerpc64")]
pub fn architecture() -> Architecture {
    Architecture::PowerPc64
}

/// Multiplier applied to every default buffer capacity. PowerPC uses a
/// smaller factor to keep blobs under its transport limit.
pub fn blob_size_factor() -> usize {
    match architecture() {
        Architecture::PowerPc64 => 8,
        _ => 15,
    }
}

/// Reads the interrupted program counter out of a signal context.
///
/// # Safety
/// `context` must be the `ucontext_t` handed to an `SA_SIGINFO` handler.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub unsafe fn program_counter(context: *const libc::c_void) -> u64 {
    let context = context as *const libc::ucontext_t;
    if context.is_null() {
        return 0;
    }
    (*context).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
}

/// Reads the interrupted program counter out of a signal context.
///
/// # Safety
/// `context` must be the `ucontext_t` handed to an `SA_SIGINFO` handler.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub unsafe fn program_counter(context: *const libc::c_void) -> u64 {
    let context = context as *const libc::ucontext_t;
    if context.is_null() {
        return 0;
    }
    (*context).uc_mcontext.pc
}

/// # Safety
/// Always safe; the context is not inspected on this target.
#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub unsafe fn program_counter(_context: *const libc::c_void) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_size_factor() {
        if architecture() == Architecture::PowerPc64 {
            assert_eq!(blob_size_factor(), 8);
        } else {
            assert_eq!(blob_size_factor(), 15);
        }
    }

    #[test]
    fn test_null_context_has_no_pc() {
        assert_eq!(unsafe { program_counter(std::ptr::null()) }, 0);
    }
}
