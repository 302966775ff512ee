// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: Kernel (cap, ipc, task, sched, mm operations)
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; W^X for user mappings;
//!             task-management calls require TaskFlags::PRIVILEGED
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_CLOSE, SYSCALL_EXIT, SYSCALL_IPC,
    SYSCALL_LINK, SYSCALL_LISTEN_IRQ, SYSCALL_NOP, SYSCALL_NOTIFY, SYSCALL_OPEN,
    SYSCALL_REDIRECT, SYSCALL_RESUME_TASK, SYSCALL_SCHEDULE, SYSCALL_SET_PAGER,
    SYSCALL_SET_TIMEOUT, SYSCALL_TASK_DESTROY, SYSCALL_TASK_SELF, SYSCALL_TRANSFER,
    SYSCALL_UNLISTEN_IRQ, SYSCALL_VM_MAP, SYSCALL_VM_RESOLVE, SYSCALL_VM_UNMAP,
};
use crate::hal::Arch;
use crate::ipc::{IpcError, IpcFlags, IpcRequest, IpcStatus, Notifications, SrcFilter};
use crate::mm::{MapError, PageFlags};
use crate::task::{ExceptionKind, TaskError, TaskFlags};
use crate::types::{ChannelId, PhysAddr, Priority, TaskId, VirtAddr};
use crate::Kernel;

/// State handed to every handler: the kernel and the task that trapped.
pub struct Context<'a, A: Arch> {
    pub kernel: &'a mut Kernel<A>,
    pub caller: TaskId,
}

impl<'a, A: Arch> Context<'a, A> {
    pub fn new(kernel: &'a mut Kernel<A>, caller: TaskId) -> Self {
        Self { kernel, caller }
    }

    fn require_privileged(&self) -> SysResult<()> {
        let task = self.kernel.task(self.caller).ok_or(TaskError::InvalidTask)?;
        if task.flags().contains(TaskFlags::PRIVILEGED) {
            Ok(())
        } else {
            Err(Error::NotPrivileged)
        }
    }
}

// Typed decoders for seL4-style Decode→Check→Execute

#[derive(Copy, Clone)]
struct IpcArgsTyped {
    channel: ChannelId,
    flags: IpcFlags,
    filter: SrcFilter,
}

impl IpcArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let flags = u32::try_from(args.get(1))
            .ok()
            .and_then(IpcFlags::from_bits)
            .ok_or(IpcError::InvalidArgument)?;
        let filter = u32::try_from(args.get(2)).map_err(|_| IpcError::InvalidArgument)?;
        Ok(Self {
            channel: decode_channel(args.get(0))?,
            flags,
            filter: SrcFilter::from_raw(filter),
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.flags.is_empty() {
            return Err(IpcError::InvalidArgument.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct VmMapArgsTyped {
    task: TaskId,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PageFlags,
}

impl VmMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let flags = u32::try_from(args.get(3))
            .ok()
            .and_then(PageFlags::from_bits)
            .ok_or(MapError::InvalidFlags)?;
        Ok(Self {
            task: decode_task(args.get(0))?,
            va: VirtAddr::new(args.get(1)),
            pa: PhysAddr::new(args.get(2)),
            flags,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if !self.va.is_page_aligned() || !self.pa.is_page_aligned() {
            return Err(MapError::Unaligned.into());
        }
        // W^X
        if self.flags.contains(PageFlags::WRITE | PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied.into());
        }
        Ok(())
    }
}

fn decode_channel(raw: usize) -> Result<ChannelId, Error> {
    u32::try_from(raw).map(ChannelId::from_raw).map_err(|_| IpcError::InvalidId.into())
}

fn decode_task(raw: usize) -> Result<TaskId, Error> {
    u32::try_from(raw).map(TaskId::from_raw).map_err(|_| TaskError::InvalidTask.into())
}

/// Writes a delivered message into `task`'s IPC buffer.
pub(crate) fn store_received<A: Arch>(kernel: &mut Kernel<A>, task: TaskId, status: IpcStatus) {
    if let IpcStatus::Completed(Some(msg)) = status {
        if let Some(buffer) = kernel.ipc_buffer_mut(task) {
            buffer.message = msg;
        }
    }
}

/// Registers every handler of this increment.
pub fn install_handlers<A: Arch>(table: &mut SyscallTable<A>) {
    table.register(SYSCALL_IPC, sys_ipc);
    table.register(SYSCALL_OPEN, sys_open);
    table.register(SYSCALL_CLOSE, sys_close);
    table.register(SYSCALL_LINK, sys_link);
    table.register(SYSCALL_TRANSFER, sys_transfer);
    table.register(SYSCALL_NOTIFY, sys_notify);
    table.register(SYSCALL_NOP, sys_nop);
    table.register(SYSCALL_REDIRECT, sys_redirect);
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_SET_TIMEOUT, sys_set_timeout);
    table.register(SYSCALL_TASK_SELF, sys_task_self);
    table.register(SYSCALL_TASK_DESTROY, sys_task_destroy);
    table.register(SYSCALL_SCHEDULE, sys_schedule);
    table.register(SYSCALL_VM_MAP, sys_vm_map);
    table.register(SYSCALL_VM_UNMAP, sys_vm_unmap);
    table.register(SYSCALL_VM_RESOLVE, sys_vm_resolve);
    table.register(SYSCALL_SET_PAGER, sys_set_pager);
    table.register(SYSCALL_RESUME_TASK, sys_resume_task);
    table.register(SYSCALL_LISTEN_IRQ, sys_listen_irq);
    table.register(SYSCALL_UNLISTEN_IRQ, sys_unlisten_irq);
}

/// `ipc(channel, flags, filter)`; message and page window come from the IPC buffer.
fn sys_ipc<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let typed = IpcArgsTyped::decode(args)?;
    typed.check()?;
    let buffer = *ctx.kernel.ipc_buffer(ctx.caller).ok_or(TaskError::InvalidTask)?;
    let req = IpcRequest {
        channel: typed.channel,
        flags: typed.flags,
        filter: typed.filter,
        message: buffer.message,
        accept: buffer.accept,
    };
    let status = ctx.kernel.ipc(ctx.caller, &req)?;
    store_received(ctx.kernel, ctx.caller, status);
    match status {
        IpcStatus::Completed(_) => Ok(0),
        IpcStatus::Pending => Err(Error::Blocked),
    }
}

fn sys_open<A: Arch>(ctx: &mut Context<'_, A>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.kernel.open(ctx.caller)?.as_raw() as usize)
}

fn sys_close<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.kernel.close(ctx.caller, decode_channel(args.get(0))?)?;
    Ok(0)
}

fn sys_link<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let from = decode_channel(args.get(0))?;
    let to = decode_channel(args.get(1))?;
    ctx.kernel.link(ctx.caller, from, to)?;
    Ok(0)
}

fn sys_transfer<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let src = decode_channel(args.get(0))?;
    let dst = decode_channel(args.get(1))?;
    Ok(ctx.kernel.transfer(ctx.caller, src, dst)?.as_raw() as usize)
}

fn sys_notify<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let channel = decode_channel(args.get(0))?;
    let bits = u32::try_from(args.get(1))
        .ok()
        .and_then(Notifications::from_bits)
        .ok_or(IpcError::InvalidArgument)?;
    ctx.kernel.notify(ctx.caller, channel, bits)?;
    Ok(0)
}

fn sys_nop<A: Arch>(_ctx: &mut Context<'_, A>, _args: &Args) -> SysResult<usize> {
    Ok(0)
}

fn sys_redirect<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let src = decode_channel(args.get(0))?;
    let dst = decode_channel(args.get(1))?;
    ctx.kernel.redirect(ctx.caller, src, dst)?;
    Ok(0)
}

fn sys_exit<A: Arch>(ctx: &mut Context<'_, A>, _args: &Args) -> SysResult<usize> {
    ctx.kernel.exit_task(ctx.caller, ExceptionKind::GraceExit)?;
    Err(Error::TaskExit)
}

fn sys_set_timeout<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let ticks = u32::try_from(args.get(0)).map_err(|_| IpcError::InvalidArgument)?;
    ctx.kernel.set_timeout(ctx.caller, ticks)?;
    Ok(0)
}

fn sys_task_self<A: Arch>(ctx: &mut Context<'_, A>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.as_raw() as usize)
}

fn sys_task_destroy<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let target = decode_task(args.get(0))?;
    ctx.kernel.destroy_task(target)?;
    if target == ctx.caller {
        return Err(Error::TaskExit);
    }
    Ok(0)
}

fn sys_schedule<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let target = decode_task(args.get(0))?;
    let priority = u8::try_from(args.get(1))
        .ok()
        .and_then(Priority::new)
        .ok_or(IpcError::InvalidArgument)?;
    ctx.kernel.schedule(target, priority)?;
    Ok(0)
}

fn sys_vm_map<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let typed = VmMapArgsTyped::decode(args)?;
    typed.check()?;
    ctx.kernel.vm_map(typed.task, typed.va, typed.pa, typed.flags)?;
    Ok(0)
}

fn sys_vm_unmap<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let task = decode_task(args.get(0))?;
    let mapping = ctx.kernel.vm_unmap(task, VirtAddr::new(args.get(1)))?;
    Ok(mapping.pa.raw())
}

fn sys_vm_resolve<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let task = decode_task(args.get(0))?;
    Ok(ctx.kernel.vm_resolve(task, VirtAddr::new(args.get(1)))?.raw())
}

/// `set_pager(task, pager)`; pager 0 drops the relation.
fn sys_set_pager<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let task = decode_task(args.get(0))?;
    let pager = match decode_task(args.get(1))? {
        TaskId::IDLE => None,
        id => Some(id),
    };
    ctx.kernel.set_pager(task, pager)?;
    Ok(0)
}

fn sys_resume_task<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    ctx.kernel.resume_task(decode_task(args.get(0))?)?;
    Ok(0)
}

fn sys_listen_irq<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    ctx.require_privileged()?;
    let irq = u32::try_from(args.get(0)).map_err(|_| IpcError::InvalidArgument)?;
    ctx.kernel.listen_irq(ctx.caller, irq)?;
    Ok(0)
}

fn sys_unlisten_irq<A: Arch>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let irq = u32::try_from(args.get(0)).map_err(|_| IpcError::InvalidArgument)?;
    ctx.kernel.unlisten_irq(ctx.caller, irq)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Message, MessageType};
    use crate::task::TaskSpec;
    use crate::testutil::{boot, spawn};

    fn args(regs: &[usize]) -> Args {
        let mut all = [0usize; 6];
        all[..regs.len()].copy_from_slice(regs);
        Args::new(all)
    }

    #[test]
    fn unknown_number_is_rejected() {
        let mut kernel = boot();
        let a = spawn(&mut kernel, "a");
        assert_eq!(kernel.syscall_as(a, 31, &args(&[])), -10);
        assert_eq!(kernel.syscall_as(a, 400, &args(&[])), -10);
    }

    #[test]
    fn table_is_populated_at_boot() {
        let kernel = boot();
        let table = kernel.syscall_table();
        for number in SYSCALL_IPC..=SYSCALL_UNLISTEN_IRQ {
            assert!(table.lookup(number).is_ok(), "syscall {number} missing");
        }
        assert_eq!(table.lookup(SYSCALL_UNLISTEN_IRQ + 1).err(), Some(Error::InvalidSyscall));
    }

    #[test]
    fn open_close_through_registers() {
        let mut kernel = boot();
        let a = spawn(&mut kernel, "a");
        let id = kernel.syscall_as(a, SYSCALL_OPEN, &args(&[]));
        assert_eq!(id, 1);
        assert_eq!(kernel.syscall_as(a, SYSCALL_CLOSE, &args(&[id as usize])), 0);
        assert_eq!(kernel.syscall_as(a, SYSCALL_CLOSE, &args(&[id as usize])), -1);
        assert_eq!(kernel.syscall_as(a, SYSCALL_TASK_SELF, &args(&[])), a.as_raw() as isize);
    }

    #[test]
    fn privileged_calls_are_gated() {
        let mut kernel = boot();
        let user = spawn(&mut kernel, "user");
        let root = kernel
            .create_task(TaskSpec::new("root").flags(crate::task::TaskFlags::PRIVILEGED))
            .unwrap();
        let raw = user.as_raw() as usize;
        assert_eq!(kernel.syscall_as(user, SYSCALL_SCHEDULE, &args(&[raw, 1])), -17);
        assert_eq!(kernel.syscall_as(root, SYSCALL_SCHEDULE, &args(&[raw, 9])), -12);
        assert_eq!(kernel.syscall_as(root, SYSCALL_SCHEDULE, &args(&[raw, 1])), 0);
        assert_eq!(kernel.task(user).unwrap().priority().as_index(), 1);
        assert_eq!(kernel.syscall_as(root, SYSCALL_TASK_DESTROY, &args(&[raw])), 0);
        assert!(kernel.task(user).is_none());
    }

    #[test]
    fn vm_map_enforces_wx() {
        let mut kernel = boot();
        let root = kernel
            .create_task(TaskSpec::new("root").flags(crate::task::TaskFlags::PRIVILEGED))
            .unwrap();
        let raw = root.as_raw() as usize;
        let wx = (PageFlags::READ | PageFlags::WRITE | PageFlags::EXECUTE).bits() as usize;
        let rw = PageFlags::USER_RW.bits() as usize;
        assert_eq!(kernel.syscall_as(root, SYSCALL_VM_MAP, &args(&[raw, 0x4000, 0x8000, wx])), -23);
        assert_eq!(kernel.syscall_as(root, SYSCALL_VM_MAP, &args(&[raw, 0x4001, 0x8000, rw])), -21);
        assert_eq!(kernel.syscall_as(root, SYSCALL_VM_MAP, &args(&[raw, 0x4000, 0x8000, rw])), 0);
        assert_eq!(kernel.syscall_as(root, SYSCALL_VM_RESOLVE, &args(&[raw, 0x4010])), 0x8010);
        assert_eq!(kernel.syscall_as(root, SYSCALL_VM_UNMAP, &args(&[raw, 0x4000])), 0x8000);
        assert_eq!(kernel.syscall_as(root, SYSCALL_VM_RESOLVE, &args(&[raw, 0x4000])), -25);
    }

    #[test]
    fn blocked_ipc_completes_through_buffer() {
        let mut kernel = boot();
        let a = spawn(&mut kernel, "a");
        let b = spawn(&mut kernel, "b");
        let (ca, cb) = kernel.connect(a, b).unwrap();
        let recv = IpcFlags::RECV.bits() as usize;
        let send = IpcFlags::SEND.bits() as usize;

        assert_eq!(kernel.syscall_as(a, SYSCALL_IPC, &args(&[ca.as_raw() as usize, recv, 0])), 0);
        assert!(kernel.task(a).unwrap().is_blocked());
        assert_eq!(kernel.complete_syscall(a), None);

        let msg = Message::new(MessageType::USER_BASE, b"ping").unwrap();
        kernel.ipc_buffer_mut(b).unwrap().message = msg;
        assert_eq!(kernel.syscall_as(b, SYSCALL_IPC, &args(&[cb.as_raw() as usize, send, 0])), 0);

        assert_eq!(kernel.complete_syscall(a), Some(0));
        let got = kernel.ipc_buffer(a).unwrap().message;
        assert_eq!(got.inline(), b"ping");
        assert_eq!(got.from, ca);
    }

    #[test]
    fn bad_flags_and_notify_bits() {
        let mut kernel = boot();
        let a = spawn(&mut kernel, "a");
        let b = spawn(&mut kernel, "b");
        let (ca, _) = kernel.connect(a, b).unwrap();
        let ch = ca.as_raw() as usize;
        assert_eq!(kernel.syscall_as(a, SYSCALL_IPC, &args(&[ch, 1, 0])), -12);
        assert_eq!(kernel.syscall_as(a, SYSCALL_NOTIFY, &args(&[ch, 1 << 30])), -12);
        let timer = Notifications::TIMER.bits() as usize;
        assert_eq!(kernel.syscall_as(a, SYSCALL_NOTIFY, &args(&[ch, timer])), 0);
        assert_eq!(kernel.task(b).unwrap().notifications(), Notifications::TIMER);
    }
}
