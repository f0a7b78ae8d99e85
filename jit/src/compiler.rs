//! Shared block compiler.
//!
//! Drives lowering of one IR block for either backend: code header,
//! optional pause check, spill reservation, region walk through the
//! per-opcode dispatch table, branch fixup, and the trailing RIP map.

use crate::code_buffer::CodeBuffer;
use crate::dispatch::DispatchTable;
use crate::{CompileConfig, CompileError, RipMapEntry, CODE_HEADER_MAGIC};
use dbt_ir::node::IrNode;
use dbt_ir::{IrBlock, NodeId, Opcode, RaData};

/// Everything a backend needs to lower one block.
pub struct CompileRequest<'a> {
    pub block: &'a IrBlock,
    pub ra: &'a RaData,
    pub config: &'a CompileConfig,
}

/// Result of one compilation: offsets into the owning code buffer.
#[derive(Debug, Clone, Copy)]
pub struct CompiledBlock {
    /// Offset of the code header.
    pub begin: usize,
    /// Offset of the first executed instruction (the dispatch target).
    pub entry: usize,
    /// Total size including header, code, and trailer.
    pub size: usize,
    /// Buffer generation this block was emitted into.
    pub generation: u64,
}

/// Optional diagnostics sink filled during compilation.
#[derive(Debug, Default)]
pub struct DebugData {
    /// (host offset from begin, host length) per region.
    pub subblocks: Vec<(u32, u32)>,
    pub host_code_size: usize,
}

/// Branch patch kinds. The site encodings differ per host ISA but
/// patching is uniform enough to live here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// x86: 32-bit displacement relative to the end of the field.
    Rel32,
    /// AArch64 B/BL: 26-bit word displacement in the low bits.
    A64Branch26,
    /// AArch64 B.cond/CBZ/CBNZ: 19-bit word displacement at bit 5.
    A64Cond19,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    kind: FixupKind,
}

/// Forward-referenced region label.
#[derive(Debug, Default)]
struct RegionLabel {
    offset: Option<usize>,
    fixups: Vec<Fixup>,
}

/// Mutable per-compilation state shared between the driver and the
/// backend's op handlers.
pub struct BlockCx<'a> {
    pub buf: &'a mut CodeBuffer,
    pub block: &'a IrBlock,
    pub ra: &'a RaData,
    pub config: &'a CompileConfig,
    pub spill_bytes: u32,
    pub block_begin: usize,
    pub rip_map: Vec<RipMapEntry>,
    labels: Vec<RegionLabel>,
    pending_target: Option<u32>,
}

impl<'a> BlockCx<'a> {
    /// Resolve a branch to `region`: either the bound target offset, or
    /// `None` after recording a fixup for the encoder's patch field at
    /// `site`.
    pub fn branch_target(&mut self, region: u32, site: usize, kind: FixupKind) -> Option<usize> {
        let label = &mut self.labels[region as usize];
        match label.offset {
            Some(off) => Some(off),
            None => {
                label.fixups.push(Fixup { at: site, kind });
                None
            }
        }
    }

    /// Defer the jump to `region` to the region-bind step; elided when
    /// the region is emitted next (fall-through).
    pub fn set_pending_target(&mut self, region: u32) {
        self.pending_target = Some(region);
    }

    fn bind_region(&mut self, region: u32) {
        let offset = self.buf.offset();
        let label = &mut self.labels[region as usize];
        debug_assert!(label.offset.is_none(), "region bound twice");
        label.offset = Some(offset);
        let fixups = std::mem::take(&mut label.fixups);
        for f in fixups {
            patch_fixup(self.buf, f, offset);
        }
    }
}

fn patch_fixup(buf: &CodeBuffer, f: Fixup, target: usize) {
    match f.kind {
        FixupKind::Rel32 => {
            let disp = target as i64 - (f.at as i64 + 4);
            assert!(
                (i32::MIN as i64..=i32::MAX as i64).contains(&disp),
                "branch displacement out of range"
            );
            buf.patch_u32(f.at, disp as u32);
        }
        FixupKind::A64Branch26 => {
            let disp = (target as i64 - f.at as i64) / 4;
            assert!((-(1 << 25)..(1 << 25)).contains(&disp));
            let insn = buf.read_u32(f.at) | ((disp as u32) & 0x03ff_ffff);
            buf.patch_u32(f.at, insn);
        }
        FixupKind::A64Cond19 => {
            let disp = (target as i64 - f.at as i64) / 4;
            assert!((-(1 << 18)..(1 << 18)).contains(&disp));
            let insn = buf.read_u32(f.at) | (((disp as u32) & 0x7_ffff) << 5);
            buf.patch_u32(f.at, insn);
        }
    }
}

/// Backend hooks the shared driver needs beyond the op table.
pub trait BlockEmitter: Sized {
    /// Look up the emitter for an opcode (by value; tables are
    /// write-once).
    fn handler(&self, op: Opcode) -> crate::dispatch::OpHandler<Self>;

    /// Store the header address into the frame and any other per-block
    /// entry bookkeeping. Runs immediately after the header bytes.
    fn emit_block_entry(&mut self, cx: &mut BlockCx<'_>);

    /// Compare the process running-mode word against zero and divert to
    /// the pause handler.
    fn emit_pause_check(&mut self, cx: &mut BlockCx<'_>);

    /// Reserve the spill area on the host stack.
    fn emit_spill_reserve(&mut self, cx: &mut BlockCx<'_>);

    /// Unconditional jump to a region label (pending-branch flush).
    fn emit_region_jump(&mut self, cx: &mut BlockCx<'_>, region: u32);

    /// Host instruction-cache maintenance for the emitted range.
    fn flush_code(&mut self, buf: &CodeBuffer, begin: usize, len: usize);
}

/// Spill slot granularity: one 16-byte slot per RA spill id.
pub const SPILL_SLOT_SIZE: u32 = 16;

/// Pessimistic bytes-per-node bound used for the overflow check before
/// emission starts. Sized for the fattest lowerings (the fallback shim
/// spills the whole RA register file around its helper call).
pub const WORST_CASE_BYTES_PER_NODE: usize = 256;
/// Fixed per-block overhead bound (header, entry, pause check,
/// trailer).
pub const WORST_CASE_BLOCK_OVERHEAD: usize = 512;

pub fn estimate_size(block: &IrBlock) -> usize {
    block.num_nodes() * WORST_CASE_BYTES_PER_NODE
        + block.num_nodes() * core::mem::size_of::<RipMapEntry>()
        + WORST_CASE_BLOCK_OVERHEAD
}

/// Lower one block. Fails with `OutOfCodeSpace` (without emitting
/// anything) when the pessimistic estimate does not fit; the caller
/// clears the cache and retries.
pub fn compile_block<B: BlockEmitter>(
    backend: &mut B,
    buf: &mut CodeBuffer,
    req: &CompileRequest<'_>,
    mut debug: Option<&mut DebugData>,
) -> Result<CompiledBlock, CompileError> {
    if buf.remaining() < estimate_size(req.block) {
        return Err(CompileError::OutOfCodeSpace);
    }

    buf.align(16);
    let block_begin = buf.offset();

    let mut cx = BlockCx {
        buf,
        block: req.block,
        ra: req.ra,
        config: req.config,
        spill_bytes: req.ra.spill_slots * SPILL_SLOT_SIZE,
        block_begin,
        rip_map: Vec::with_capacity(16),
        labels: Vec::new(),
        pending_target: None,
    };
    cx.labels
        .resize_with(req.block.regions().len(), RegionLabel::default);

    // Header placeholder; the tail offset is patched once known.
    cx.buf.emit_u64(0);
    cx.buf.emit_u64(CODE_HEADER_MAGIC);

    let entry = cx.buf.offset();
    backend.emit_block_entry(&mut cx);

    if req.config.pause_check {
        backend.emit_pause_check(&mut cx);
    }
    if cx.spill_bytes != 0 {
        backend.emit_spill_reserve(&mut cx);
    }

    for region in 0..req.block.regions().len() as u32 {
        // Flush a pending branch unless it falls through to this
        // region.
        if let Some(p) = cx.pending_target.take() {
            if p != region {
                backend.emit_region_jump(&mut cx, p);
            }
        }
        let region_start = cx.buf.offset();
        cx.bind_region(region);

        for id in req.block.region_nodes(region) {
            let node = req.block.node(id);
            match node.op {
                Opcode::Nop | Opcode::InlineConstant => continue,
                Opcode::InsnStart => {
                    cx.rip_map.push(RipMapEntry {
                        host_off: (cx.buf.offset() - block_begin) as u32,
                        guest_off: node.imm as u32,
                    });
                    continue;
                }
                _ => {}
            }
            let handler = backend.handler(node.op);
            handler(backend, &mut cx, id, node)?;
        }

        if let Some(d) = debug.as_deref_mut() {
            d.subblocks.push((
                (region_start - block_begin) as u32,
                (cx.buf.offset() - region_start) as u32,
            ));
        }
    }

    if let Some(p) = cx.pending_target.take() {
        backend.emit_region_jump(&mut cx, p);
    }

    // Block trailer: identity record plus the RIP map, 8-aligned so
    // the signal adapter can read it with plain loads.
    cx.buf.align(8);
    let tail_off = cx.buf.offset();
    let tail_size = 24 + cx.rip_map.len() * core::mem::size_of::<RipMapEntry>();
    let total_size = (tail_off + tail_size) - block_begin;

    cx.buf.emit_u64(req.block.entry_rip);
    cx.buf.emit_u64(total_size as u64);
    cx.buf.emit_u32(24); // rip_map_offset from tail start
    cx.buf.emit_u32(cx.rip_map.len() as u32);
    for e in &cx.rip_map {
        cx.buf.emit_u32(e.host_off);
        cx.buf.emit_u32(e.guest_off);
    }

    cx.buf.patch_u32(block_begin, (tail_off - block_begin) as u32);
    cx.buf.patch_u32(block_begin + 4, 0);

    let generation = cx.buf.generation();
    backend.flush_code(cx.buf, block_begin, total_size);

    if let Some(d) = debug {
        d.host_code_size = total_size;
    }

    tracing::debug!(
        rip = format_args!("{:#x}", req.block.entry_rip),
        size = total_size,
        nodes = req.block.num_nodes(),
        "compiled block"
    );

    Ok(CompiledBlock {
        begin: block_begin,
        entry,
        size: total_size,
        generation,
    })
}
