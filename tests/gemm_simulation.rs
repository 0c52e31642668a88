use mvejit::config::{GemmConfig, GemmShape};
use mvejit::core::Fault;
use mvejit::kernels::GemmGenerator;
use mvejit::reference::{self, dyadic};
use mvejit::sim::{self, GemmRun};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn generate(shape: GemmShape, config: GemmConfig) -> Vec<u16> {
    let mut buffer = vec![0u16; 8192];
    let mut generator = GemmGenerator::with_config(&mut buffer, config).unwrap();
    let generated = generator.generate(shape);
    assert!(generated.is_valid(), "{shape:?}: {:?}", generated.faults());
    generated.code().to_vec()
}

/// Run the kernel for `shape` and compare bit for bit with the oracle.
fn check_with(shape: GemmShape, config: GemmConfig, seed: u32, zero_c: bool) -> GemmRun {
    let code = generate(shape, config);
    run_checked(&code, shape, seed, zero_c)
}

fn run_checked(code: &[u16], shape: GemmShape, seed: u32, zero_c: bool) -> GemmRun {
    let a = dyadic(shape.a_len(), seed);
    let b = dyadic(shape.b_len(), seed + 1);
    let c = if zero_c {
        vec![0.0; shape.c_len()]
    } else {
        dyadic(shape.c_len(), seed + 2)
    };
    let run = sim::run_gemm(code, &shape, &a, &b, &c)
        .unwrap_or_else(|err| panic!("{shape:?}: {err}"));
    let mut expected = c;
    reference::gemm(&shape, &a, &b, &mut expected);
    for (index, (got, want)) in run.c.iter().zip(&expected).enumerate() {
        assert_eq!(
            got.to_bits(),
            want.to_bits(),
            "{shape:?}: C[{}, {}] = {got}, expected {want}",
            index % shape.ldc as usize,
            index / shape.ldc as usize
        );
    }
    assert!(run.canary_intact, "{shape:?}: wrote past C");
    assert!(run.callee_saved_intact, "{shape:?}: callee-saved registers clobbered");
    run
}

fn check(shape: GemmShape) -> GemmRun {
    check_with(shape, GemmConfig::default(), shape.m * 131 + shape.k * 17 + shape.n, false)
}

#[test]
fn small_shapes_match_reference() {
    init();
    for m in 1..=16 {
        for k in 1..=16 {
            for n in 1..=16 {
                check(GemmShape::new(m, k, n));
            }
        }
    }
}

#[test]
fn zero_initial_c() {
    init();
    for shape in [
        GemmShape::new(1, 1, 1),
        GemmShape::new(7, 3, 2),
        GemmShape::new(16, 5, 1),
        GemmShape::new(13, 9, 7),
    ] {
        check_with(shape, GemmConfig::default(), 99, true);
    }
}

#[test]
fn cubes_match_reference() {
    init();
    for size in [24, 48] {
        let run = check(GemmShape::new(size, size, size));
        assert!(run.steps > u64::from(size * size));
    }
}

#[test]
fn padded_leading_dimensions_leave_gaps_untouched() {
    init();
    let shape = GemmShape::new(6, 5, 4).with_leading_dimensions(9, 7, 11);
    let a = dyadic(shape.a_len(), 1);
    let b = dyadic(shape.b_len(), 2);
    let c = dyadic(shape.c_len(), 3);
    let code = generate(shape, GemmConfig::default());
    let run = sim::run_gemm(&code, &shape, &a, &b, &c).unwrap();
    for j in 0..4 {
        for i in 6..11 {
            let index = i + j * 11;
            assert_eq!(run.c[index].to_bits(), c[index].to_bits(), "row {i} column {j}");
        }
    }
    check(shape);
    check(GemmShape::new(17, 3, 5).with_leading_dimensions(20, 4, 19));
    check(GemmShape::new(3, 8, 10).with_leading_dimensions(3, 64, 5));
}

#[test]
fn large_strides_use_registers() {
    init();
    // A column stride too big for any immediate, B and C strides too big for offsets.
    check(GemmShape::new(8, 4, 3).with_leading_dimensions(1200, 700, 300));
    // A stride in ADDW range.
    check(GemmShape::new(5, 6, 2).with_leading_dimensions(600, 6, 5));
    // Loops around wide strides.
    check(GemmShape::new(20, 3, 7).with_leading_dimensions(1030, 1100, 40));
    check(GemmShape::new(33, 2, 1).with_leading_dimensions(2000, 2, 33));
}

#[test]
fn partial_rows_never_touch_the_canary() {
    init();
    for m in [5, 6, 7] {
        for n in [1, 2, 3, 4] {
            let run = check(GemmShape::new(m, 4, n));
            assert!(run.canary_intact);
        }
    }
}

#[test]
fn alternative_tilings() {
    init();
    let narrow = GemmConfig {
        tile_m: 4,
        tile_n: 2,
        ..GemmConfig::default()
    };
    let tall = GemmConfig {
        tile_m: 12,
        tile_n: 1,
        column_tile_m: 12,
    };
    for config in [narrow, tall] {
        for (m, k, n) in [(1, 1, 1), (9, 4, 5), (16, 7, 3), (25, 2, 9)] {
            check_with(GemmShape::new(m, k, n), config, m + n, false);
        }
    }
}

#[test]
fn generation_is_deterministic() {
    let shape = GemmShape::new(21, 13, 11);
    assert_eq!(
        generate(shape, GemmConfig::default()),
        generate(shape, GemmConfig::default())
    );

    let mut buffer = vec![0u16; 4096];
    let mut generator = GemmGenerator::new(&mut buffer).unwrap();
    let first = generator.generate(shape).code().to_vec();
    generator.generate(GemmShape::new(3, 3, 3));
    assert_eq!(generator.generate(shape).code(), first.as_slice());
}

/// Generate `shape`, expecting only the given register shortfalls, and run the kernel.
fn check_short_of_registers(shape: GemmShape, expected: &[&str]) -> GemmRun {
    let mut buffer = vec![0u16; 8192];
    let mut generator = GemmGenerator::new(&mut buffer).unwrap();
    let generated = generator.generate(shape);
    assert!(!generated.is_valid());
    let unavailable: Vec<_> = generated
        .faults()
        .iter()
        .map(|fault| match fault {
            Fault::RegisterUnavailable { value } => *value,
            other => panic!("{shape:?}: unexpected fault {other}"),
        })
        .collect();
    assert_eq!(unavailable, expected);
    run_checked(generated.code(), shape, shape.m + shape.n, false)
}

#[test]
fn unencodable_loop_bound_without_register_still_terminates() {
    init();
    // B stride, A stride and both C columns take R9-R12; 2056 is no modified immediate.
    let shape = GemmShape::new(2060, 2, 3).with_leading_dimensions(2060, 600, 2060);
    let run = check_short_of_registers(shape, &["the m loop bound"]);
    assert!(run.canary_intact);
}

#[test]
fn far_c_column_without_register_is_still_written() {
    init();
    // R10-R12 go to the B stride, the A stride and C column 1.
    let shape = GemmShape::new(9, 3, 4).with_leading_dimensions(1200, 1100, 300);
    check_short_of_registers(shape, &["the C column 2 base"]);
    let shape = GemmShape::new(20, 4, 7).with_leading_dimensions(1030, 1100, 140);
    check_short_of_registers(shape, &["the C column 2 base"]);
}

#[test]
fn large_problem_reports_every_missing_register() {
    init();
    let shape = GemmShape::new(2060, 1200, 1000);
    let mut buffer = vec![0u16; 4096];
    let mut generator = GemmGenerator::new(&mut buffer).unwrap();
    let generated = generator.generate(shape);
    assert!(!generated.faults().iter().any(Fault::is_fatal));
    assert!(generated
        .faults()
        .iter()
        .all(|fault| matches!(fault, Fault::RegisterUnavailable { .. })));
    assert_eq!(generated.faults().len(), 3);
}

#[test]
fn fatal_faults_leave_a_return_stub() {
    init();
    let mut buffer = vec![0u16; 32];
    let mut generator = GemmGenerator::new(&mut buffer).unwrap();
    let generated = generator.generate(GemmShape::new(16, 16, 16));
    assert_eq!(generated.code(), &[0x4770]);
    assert!(generated.faults().iter().any(Fault::is_fatal));
    assert!(generated.into_result().is_err());

    let shape = GemmShape::new(4, 4, 4).with_leading_dimensions(3, 4, 4);
    let generated = generator.generate(shape);
    assert_eq!(generated.code(), &[0x4770]);

    // The stub is a valid function that leaves C alone.
    let c = dyadic(shape.c_len(), 5);
    let run = sim::run_gemm(
        generated.code(),
        &GemmShape::new(4, 4, 4),
        &dyadic(16, 1),
        &dyadic(16, 2),
        &c,
    )
    .unwrap();
    assert_eq!(run.c, c);
    assert_eq!(run.steps, 1);
    assert!(run.callee_saved_intact);
}
