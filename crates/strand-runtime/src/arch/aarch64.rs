//! aarch64 context switching (AAPCS64)
//!
//! Saves x19-x28, fp, lr, sp and the low halves of v8-v15.

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved register file of a suspended fiber.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub x19_x28: [u64; 10], // 0x00
    pub fp: u64,            // 0x50
    pub lr: u64,            // 0x58
    pub sp: u64,            // 0x60
    pub d8_d15: [u64; 8],   // 0x68
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
    let mut regs = [0u64; 10];
    regs[0] = entry as usize as u64; // x19
    regs[1] = arg as u64; // x20

    *ctx = Context {
        x19_x28: regs,
        lr: entry_trampoline as usize as u64,
        sp: ((stack_top as usize) & !0xF) as u64,
        ..Context::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the running context into `from` and resume `to`.
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
