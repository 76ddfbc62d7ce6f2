//! End-to-end lowering tests through the public API.

use std::collections::HashMap;
use tilegen::lir::verify::verify_function;
use tilegen::target::NvidiaTarget;
use tilegen::{compile, parse_module, target_from_name, CodegenConfig, CompileError};

fn lower_text(text: &str, target: &str, config: &CodegenConfig) -> Result<String, CompileError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let parsed = parse_module(text)?;
    let target = target_from_name(target)?;
    let out = compile(&parsed, target.as_ref(), config)?;
    Ok(out.module.to_string())
}

/// Helper to check if output contains expected patterns
fn check_output_contains(output: &str, patterns: &[&str]) {
    for pattern in patterns {
        assert!(
            output.contains(pattern),
            "Output missing expected pattern: '{pattern}'\nFull output:\n{output}"
        );
    }
}

const EXP: &str = r#"
#blk = scanline<shape=[512], order=[0], nts=[4], mts=[128]>
func @softplus(%x: ptr<f32> noalias readonly, %y: ptr<f32> noalias writeonly) {
entry:
  %r = make_range 0 : i32[512] #blk
  %px = splat %x : ptr<f32>[512] #blk
  %p = gep %px, %r : ptr<f32>[512] #blk !align 4
  %v = load %p : f32[512] #blk
  %e = exp %v : f32[512] #blk
  %one = const 1.0 : f32[512] #blk
  %s = fadd %e, %one : f32[512] #blk
  %l = log %s : f32[512] #blk
  %py = splat %y : ptr<f32>[512] #blk
  %q = gep %py, %r : ptr<f32>[512] #blk !align 4
  store %q, %l
  ret
}
"#;

#[test]
fn test_elementwise_kernel_lowers_and_verifies() {
    let output = lower_text(EXP, "sm80", &CodegenConfig::default()).unwrap();
    check_output_contains(
        &output,
        &[
            "; target sm_80",
            "kernel void @softplus(",
            "noalias readonly %x",
            "noalias writeonly %y",
            "maxntid(128)",
            "ld.global.v4.b32",
            "@ex2.approx.f32",
            "@lg2.approx.f32",
            "ret void",
        ],
    );
    assert!(!output.contains("bar.sync"), "{output}");
}

#[test]
fn test_num_warps_from_environment() {
    let vars: HashMap<&str, &str> = [("TILEGEN_NUM_WARPS", "2"), ("TILEGEN_VERIFY", "off")]
        .into_iter()
        .collect();
    let config = CodegenConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
    assert_eq!(config.num_warps, 2);
    assert!(!config.verify);
    assert!(config.async_copy);

    let text = EXP.replace("nts=[4], mts=[128]", "nts=[8], mts=[64]");
    let output = lower_text(&text, "sm80", &config).unwrap();
    check_output_contains(&output, &["maxntid(64)"]);
}

#[test]
fn test_layout_thread_count_must_match_warps() {
    let config = CodegenConfig::default().with_num_warps(8);
    let err = lower_text(EXP, "sm80", &config).unwrap_err();
    assert!(matches!(err, CompileError::Internal { .. }), "{err}");
}

#[test]
fn test_every_gpu_target_verifies() {
    let parsed = parse_module(EXP).unwrap();
    for name in ["sm70", "sm80", "sm90", "gfx90a"] {
        let target = target_from_name(name).unwrap();
        let out = compile(&parsed, target.as_ref(), &CodegenConfig::default()).unwrap();
        for func in &out.module.functions {
            verify_function(func).unwrap_or_else(|e| panic!("{name}: {e}"));
        }
        assert_eq!(out.stats.functions_compiled, 1);
        assert_eq!(out.stats.opcode_counts.get("exp"), Some(&1));
        assert!(out.stats.instructions_emitted > 0);
        assert_eq!(
            out.stats.largest_function,
            Some(("softplus".to_string(), out.module.functions[0].num_insts()))
        );
    }
}

#[test]
fn test_unknown_target_is_rejected() {
    let err = lower_text(EXP, "tpu", &CodegenConfig::default()).unwrap_err();
    assert_eq!(
        err,
        CompileError::UnknownTarget {
            name: "tpu".to_string()
        }
    );
}

#[test]
fn test_parse_errors_carry_line_numbers() {
    let text = "func @k() {\nentry:\n  %x = frobnicate : i32\n  ret\n}\n";
    let err = lower_text(text, "sm80", &CodegenConfig::default()).unwrap_err();
    match err {
        CompileError::Parse { line, message } => {
            assert_eq!(line, 3);
            assert!(message.contains("frobnicate"), "{message}");
        }
        other => panic!("expected a parse error, got {other}"),
    }
}

fn fp8_kernel(nts: u32) -> String {
    let mts = 256 / nts;
    format!(
        r#"
#blk = scanline<shape=[256], order=[0], nts=[{nts}], mts=[{mts}]>
func @k(%x: ptr<fp8>, %y: ptr<f16>) {{
entry:
  %r = make_range 0 : i32[256] #blk
  %px = splat %x : ptr<fp8>[256] #blk
  %p = gep %px, %r : ptr<fp8>[256] #blk
  %v = load %p : fp8[256] #blk
  %h = fpext %v : f16[256] #blk
  %py = splat %y : ptr<f16>[256] #blk
  %q = gep %py, %r : ptr<f16>[256] #blk
  store %q, %h
  ret
}}
"#
    )
}

#[test]
fn test_fp8_needs_groups_of_four() {
    let config = CodegenConfig::default().with_num_warps(2);
    let output = lower_text(&fp8_kernel(4), "sm80", &config).unwrap();
    check_output_contains(&output, &["maxntid(64)"]);

    let config = CodegenConfig::default().with_num_warps(4);
    let err = lower_text(&fp8_kernel(2), "sm80", &config).unwrap_err();
    assert!(err.is_unsupported(), "{err}");
}

#[test]
fn test_mma_layout_needs_volta() {
    let text = r#"
#m = mma<shape=[32, 32], wpt=[2, 2]>
func @k() {
entry:
  %x = make_range 0 : i32[32, 32] #m
  ret
}
"#;
    assert!(lower_text(text, "sm80", &CodegenConfig::default()).is_ok());
    let err = lower_text(text, "sm60", &CodegenConfig::default()).unwrap_err();
    assert!(err.is_unsupported());
}

#[test]
fn test_shared_tiles_need_a_gpu() {
    let text = r#"
#blk = scanline<shape=[8], order=[0], nts=[8], mts=[1]>
#smem = shared<shape=[8], order=[0], elem=f32, vec=1, per_phase=1, max_phase=1>
func @k(%x: f32) {
entry:
  %t = splat %x : f32[8] #blk
  %s = copy_to_shared %t : f32[8] #smem
  ret
}
"#;
    let err = lower_text(text, "host", &CodegenConfig::default()).unwrap_err();
    assert!(err.is_unsupported(), "{err}");
}

#[test]
fn test_shared_arena_is_sized_by_allocation() {
    let text = r#"
#blk = scanline<shape=[16, 16], order=[1, 0], nts=[1, 2], mts=[16, 8]>
#sa = shared<shape=[16, 16], order=[1, 0], elem=f32, vec=2, per_phase=1, max_phase=8>
#sb = shared<shape=[16, 16], order=[1, 0], elem=f32, vec=2, per_phase=1, max_phase=8>
func @k(%x: f32) {
entry:
  %t = splat %x : f32[16, 16] #blk
  %a = copy_to_shared %t : f32[16, 16] #sa
  %b = copy_to_shared %t : f32[16, 16] #sb
  ret
}
"#;
    let parsed = parse_module(text).unwrap();
    let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
    assert_eq!(out.module.shared_bytes, 2 * 16 * 16 * 4);
    assert_eq!(out.stats.shared_bytes, out.module.shared_bytes);
    check_output_contains(
        &out.module.to_string(),
        &["@shared = external addrspace(3) global [2048 x i8]"],
    );
}
