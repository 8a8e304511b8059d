//! x86_64 context switching (System V)
//!
//! Uses naked functions, stable since Rust 1.88.

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved register file of a suspended fiber.
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare `ctx` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable stack that outlives the
/// context.
#[inline]
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by `jmp`, so rsp must already satisfy the
    // 16-byte alignment its `call` expects.
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context {
        rsp: sp as u64,
        rip: entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        ..Context::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry functions switch away for good; returning is a bug
        "ud2",
    );
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // save into rdi
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // load from rsi
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);
    static mut MAIN: Context = Context { rsp: 0, rip: 0, rbx: 0, rbp: 0, r12: 0, r13: 0, r14: 0, r15: 0 };
    static mut SIDE: Context = Context { rsp: 0, rip: 0, rbx: 0, rbp: 0, r12: 0, r13: 0, r14: 0, r15: 0 };

    extern "C" fn side(arg: usize) {
        SEEN.store(arg, Ordering::SeqCst);
        unsafe { switch_context(&raw mut SIDE, &raw const MAIN) };
    }

    #[test]
    fn test_init_aligns_stack() {
        let mut ctx = Context::default();
        let mut buf = vec![0u8; 256];
        let top = unsafe { buf.as_mut_ptr().add(250) };
        unsafe { init_context(&mut ctx, top, side, 0) };
        assert_eq!(ctx.rsp % 16, 0);
        assert!(ctx.rsp as usize <= top as usize);
        assert_eq!(ctx.r12, side as usize as u64);
    }

    #[test]
    fn test_switch_round_trip() {
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        unsafe {
            init_context(&mut *(&raw mut SIDE), top, side, 77);
            switch_context(&raw mut MAIN, &raw const SIDE);
        }
        assert_eq!(SEEN.load(Ordering::SeqCst), 77);
    }
}
