//! End-to-end rewrite scenarios.

use byvalver::{Arch, BadByteSet, ResidualReason, RewriteError, Rewriter};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_clean(bytes: &[u8], bad: &BadByteSet) {
    for (i, &b) in bytes.iter().enumerate() {
        assert!(!bad.is_bad(b), "forbidden byte {:#04x} at offset {:#x}", b, i);
    }
}

#[test]
fn x86_zero_load() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::X86, bad.clone());
    // mov eax, 0
    let out = rewriter.rewrite(&[0xb8, 0x00, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(out.bytes, vec![0x31, 0xc0], "xor eax, eax");
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
}

#[test]
fn x86_small_constant_in_bl() {
    init_logging();
    let bad = BadByteSet::new(&[0x03]);
    let rewriter = Rewriter::new(Arch::X86, bad.clone());
    // mov bl, 3
    let out = rewriter.rewrite(&[0xb3, 0x03]).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
    // xor ebx, ebx ; inc bx ; inc bx ; inc bx
    assert_eq!(
        out.bytes,
        vec![0x31, 0xdb, 0x66, 0x43, 0x66, 0x43, 0x66, 0x43]
    );
}

#[test]
fn x86_near_jmp_straddles_rewrite() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::X86, bad.clone());
    // mov eax, 0 ; jmp +5 (to the ret) ; 5 nops ; ret
    let mut code = vec![0xb8, 0x00, 0x00, 0x00, 0x00, 0xeb, 0x05];
    code.extend_from_slice(&[0x90; 5]);
    code.push(0xc3);
    let out = rewriter.rewrite(&code).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());

    // The mov shrank to xor; every record must still be present and the
    // jump displacement must reach the relocated ret.
    assert_eq!(out.records.len(), 8);
    let ret_record = out
        .records
        .iter()
        .find(|r| r.old_address == 12)
        .expect("ret record");
    let jmp_record = out
        .records
        .iter()
        .find(|r| r.old_address == 5)
        .expect("jmp record");
    let jmp_end = jmp_record.new_offset + jmp_record.new_size;
    let disp = out.bytes[(jmp_end - 1) as usize] as i8;
    assert_eq!(
        (jmp_end as i64 + disp as i64) as u32,
        ret_record.new_offset,
        "jmp resolves to the relocated ret"
    );
    assert_eq!(out.bytes[ret_record.new_offset as usize], 0xc3);
}

#[test]
fn arm32_mov_unencodable_immediate() {
    init_logging();
    let bad = BadByteSet::new(&[0xff]);
    let rewriter = Rewriter::new(Arch::Arm32, bad.clone());
    // mov r0, #0xff
    let out = rewriter.rewrite(&0xe3a0_00ffu32.to_le_bytes()).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
    // mov r0, #0x100 ; sub r0, r0, #1
    assert_eq!(out.bytes.len(), 8);
    let w0 = u32::from_le_bytes(out.bytes[0..4].try_into().unwrap());
    let w1 = u32::from_le_bytes(out.bytes[4..8].try_into().unwrap());
    assert_eq!(w0, 0xe3a0_0c01);
    assert_eq!(w1, 0xe240_0001);
}

#[test]
fn arm32_conditional_branch_inverted_skip() {
    init_logging();
    // bne +16: the imm24 word and the PC-arithmetic alternative are both
    // poisoned, leaving the inverted-skip pair.
    let bad = BadByteSet::new(&[0x1a, 0x8f]);
    let rewriter = Rewriter::new(Arch::Arm32, bad.clone());
    let out = rewriter.rewrite(&0x1a00_0004u32.to_le_bytes()).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
    assert_eq!(out.bytes.len(), 8);
    let w0 = u32::from_le_bytes(out.bytes[0..4].try_into().unwrap());
    let w1 = u32::from_le_bytes(out.bytes[4..8].try_into().unwrap());
    // beq +0 (skip the next word) ; b with the offset reduced by one word
    assert_eq!(w0, 0x0a00_0000);
    assert_eq!(w1, 0xea00_0003);
}

#[test]
fn arm32_conditional_branch_pc_arith_under_nulls() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::Arm32, bad.clone());
    let out = rewriter.rewrite(&0x1a00_0004u32.to_le_bytes()).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
    // addne pc, pc, #16
    assert_eq!(out.bytes, 0x128f_f010u32.to_le_bytes());
}

#[test]
fn residual_reporting_under_total_ban() {
    init_logging();
    let all: Vec<u8> = (0..=255u8).collect();
    let bad = BadByteSet::new(&all);
    let rewriter = Rewriter::new(Arch::X86, bad);
    // mov eax, 1 ; ret
    let code = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
    let out = rewriter.rewrite(&code).unwrap();
    assert_eq!(out.bytes, code, "identity fallback for every instruction");
    assert_eq!(out.records.len(), 2);
    assert_eq!(out.residuals.len(), 2);
    for residual in &out.residuals {
        assert_eq!(residual.reason, ResidualReason::NoCleanEncoding);
    }
    assert_eq!(out.residuals[0].address, 0);
    assert_eq!(out.residuals[1].address, 5);
}

#[test]
fn clean_input_with_bare_engine_is_identity() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::bare(Arch::X86, bad);
    // xor eax, eax ; jmp +2 ; 2 nops ; ret
    let code = [0x31, 0xc0, 0xeb, 0x02, 0x90, 0x90, 0xc3];
    let out = rewriter.rewrite(&code).unwrap();
    assert_eq!(out.bytes, code);
    assert!(out.residuals.is_empty());
    assert_eq!(out.records.len(), 5);
}

#[test]
fn record_count_equals_instruction_count() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::X86, bad);
    // A mix of rewritten and untouched instructions.
    let code = [
        0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
        0x50, // push eax
        0x89, 0xc3, // mov ebx, eax
        0x5b, // pop ebx
        0xc3, // ret
    ];
    let out = rewriter.rewrite(&code).unwrap();
    assert_eq!(out.records.len(), 5);
    for record in &out.records {
        let start = record.new_offset as usize;
        let end = start + record.new_size as usize;
        assert!(end <= out.bytes.len(), "record within output");
        assert!(record.new_size > 0);
    }
}

#[test]
fn arm64_movz_recomposes() {
    init_logging();
    // movz x5, #0xbeef, lsl #16 carries 0xb7 in its encoding.
    let bad = BadByteSet::new(&[0xb7]);
    let rewriter = Rewriter::new(Arch::Arm64, bad.clone());
    let out = rewriter.rewrite(&0xd2b7_dde5u32.to_le_bytes()).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
    assert_eq!(out.bytes.len() % 4, 0);
    assert!(out.bytes.len() >= 8, "recomposed into multiple words");
}

#[test]
fn x64_zero_load() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::X64, bad.clone());
    // mov rax, 0 (movabs form would be unusual; use the common C7 form via
    // 32-bit mov which zero extends)
    let out = rewriter.rewrite(&[0xb8, 0x00, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(out.bytes, vec![0x31, 0xc0]);
    assert!(out.residuals.is_empty());
}

#[test]
fn base_address_shifts_branch_targets() {
    init_logging();
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::X86, bad.clone()).base_address(0x40_1000);
    let mut code = vec![0xb8, 0x00, 0x00, 0x00, 0x00, 0xeb, 0x05];
    code.extend_from_slice(&[0x90; 5]);
    code.push(0xc3);
    let out = rewriter.rewrite(&code).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
}

#[test]
fn obfuscation_is_deterministic_per_seed() {
    init_logging();
    let bad = BadByteSet::null_only();
    let code = [
        0xb8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0x31, 0xdb, // xor ebx, ebx
        0x43, // inc ebx
        0xc3, // ret
    ];
    let run = || {
        Rewriter::new(Arch::X86, bad.clone())
            .enable_obfuscation(true)
            .rng_seed(0x1234)
            .rewrite(&code)
            .unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.bytes, b.bytes);
    assert_clean(&a.bytes, &bad);

    let c = Rewriter::new(Arch::X86, bad.clone())
        .enable_obfuscation(true)
        .rng_seed(0x9999)
        .rewrite(&code)
        .unwrap();
    assert_clean(&c.bytes, &bad);
}

#[test]
fn empty_bad_byte_set_is_pass_through() {
    init_logging();
    let rewriter = Rewriter::new(Arch::X86, BadByteSet::empty());
    // Not even decodable; the pass-through never disassembles.
    let code = [0x0f, 0x00, 0xff];
    let out = rewriter.rewrite(&code).unwrap();
    assert_eq!(out.bytes, code);
}

#[test]
fn decode_error_reports_offset() {
    init_logging();
    let rewriter = Rewriter::new(Arch::X86, BadByteSet::null_only());
    // nop, then a dangling two-byte opcode prefix.
    let err = rewriter.rewrite(&[0x90, 0x0f]).unwrap_err();
    assert_eq!(err, RewriteError::Decode { offset: 1 });
}

#[test]
fn zero_iteration_ceiling_is_a_config_error() {
    init_logging();
    let rewriter = Rewriter::new(Arch::X86, BadByteSet::null_only()).iteration_ceiling(0);
    let err = rewriter.rewrite(&[0x90]).unwrap_err();
    assert!(matches!(err, RewriteError::Config(_)));
}

#[test]
fn cancellation_aborts_between_instructions() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    init_logging();
    let flag = Arc::new(AtomicBool::new(false));
    flag.store(true, Ordering::Relaxed);
    let rewriter =
        Rewriter::new(Arch::X86, BadByteSet::null_only()).cancel_flag(Arc::clone(&flag));
    let err = rewriter.rewrite(&[0x90, 0x90]).unwrap_err();
    assert_eq!(err, RewriteError::Cancelled);
}

#[test]
fn widening_is_monotone_across_growing_gaps() {
    init_logging();
    // A short jump over a run of movs that all grow when rewritten; the
    // displacement eventually outgrows rel8 and must widen, never shrink.
    let bad = BadByteSet::null_only();
    let rewriter = Rewriter::new(Arch::X86, bad.clone());
    let mut code = Vec::new();
    // jmp over 20 five-byte movs (disp 100) to the ret.
    code.push(0xeb);
    code.push(100);
    for _ in 0..20 {
        // mov eax, 0x11000000 -> rewritten to a longer clean sequence
        code.extend_from_slice(&[0xb8, 0x00, 0x00, 0x00, 0x11]);
    }
    code.push(0xc3);
    let out = rewriter.rewrite(&code).unwrap();
    assert_clean(&out.bytes, &bad);
    assert!(out.residuals.is_empty());
    // The ret must still be reachable through the rewritten jump; find its
    // record and check the final displacement field.
    let ret_old = 2 + 20 * 5;
    let ret_record = out
        .records
        .iter()
        .find(|r| r.old_address == ret_old as u64)
        .expect("ret record");
    assert_eq!(out.bytes[ret_record.new_offset as usize], 0xc3);
    let jmp = &out.records[0];
    assert!(jmp.new_size >= 2);
}
