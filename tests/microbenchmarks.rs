use mvejit::core::{Fault, QReg, Reg, SReg};
use mvejit::kernels::{ConstantGenerator, PeakGenerator, StreamGenerator, TriadGenerator};
use mvejit::reference::dyadic;
use mvejit::sim::{self, Machine, SimError};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn triad_matches_scalar_loop() {
    init();
    let mut buffer = vec![0u16; 64];
    let mut generator = TriadGenerator::new(&mut buffer).unwrap();
    for scalar in [2.0f32, 3.0, -0.375] {
        let generated = generator.generate(scalar);
        assert!(generated.is_valid(), "{:?}", generated.faults());
        for len in (0..=9).chain([16, 37]) {
            let a = dyadic(len, 11);
            let b = dyadic(len, 12);
            let out = sim::run_triad(generated.code(), &a, &b, len)
                .unwrap_or_else(|err| panic!("len {len}: {err}"));
            let expected: Vec<f32> = a.iter().zip(&b).map(|(a, b)| a.mul_add(scalar, *b)).collect();
            assert_eq!(out, expected, "scalar {scalar}, len {len}");
        }
    }
}

fn stream_machine(floats: usize) -> Machine {
    let mut machine = Machine::new();
    machine
        .memory_mut()
        .map_f32s(sim::A_BASE, &dyadic(floats, 3), false)
        .unwrap();
    machine
}

#[test]
fn stream_reads_exactly_its_input() {
    init();
    let mut buffer = vec![0u16; 256];
    let mut generator = StreamGenerator::new(&mut buffer).unwrap();
    let generated = generator.generate(5);
    assert!(generated.is_valid());
    let code = generated.code();

    let mut machine = stream_machine(3 * 5 * 4);
    let end = machine.call(code, &[sim::A_BASE, 3]).unwrap();
    assert_eq!(end, sim::A_BASE + 3 * 5 * 16);

    let mut machine = stream_machine(0);
    assert_eq!(machine.call(code, &[sim::A_BASE, 0]), Ok(sim::A_BASE));

    let mut machine = stream_machine(3 * 5 * 4 - 1);
    assert!(matches!(
        machine.call(code, &[sim::A_BASE, 3]),
        Err(SimError::Unmapped { .. })
    ));
}

#[test]
fn stream_rejects_bad_unroll() {
    let mut buffer = vec![0u16; 256];
    let mut generator = StreamGenerator::new(&mut buffer).unwrap();
    let generated = generator.generate(65);
    assert_eq!(generated.code(), &[0x4770]);
    assert!(matches!(generated.faults(), [Fault::InvalidShape { .. }]));
}

#[test]
fn peak_accumulates_one_per_fma() {
    init();
    let mut buffer = vec![0u16; 256];
    let mut generator = PeakGenerator::new(&mut buffer).unwrap();
    let generated = generator.generate(24);
    assert!(generated.is_valid());
    let mut machine = Machine::new();
    let before = machine.clone();
    machine.call(generated.code(), &[10]).unwrap();
    for q in [QReg::Q0, QReg::Q1, QReg::Q2, QReg::Q3] {
        assert_eq!(machine.q(q), [40.0; 4], "{q:?}");
    }
    assert!(machine.callee_saved_match(&before));
    assert_eq!(machine.reg(Reg::R7), before.reg(Reg::R7));

    let mut machine = Machine::new();
    machine.call(generated.code(), &[0]).unwrap();
    assert_eq!(machine.q(QReg::Q0), [0.0; 4]);
}

#[test]
fn constants_are_returned() {
    init();
    let mut buffer = vec![0u16; 16];
    let mut generator = ConstantGenerator::new(&mut buffer).unwrap();
    for value in [0, 42, 255, 256, -1, -2, 0x1234_5678, i32::MIN] {
        let generated = generator.generate(value);
        assert!(generated.is_valid());
        let mut machine = Machine::new();
        assert_eq!(machine.call(generated.code(), &[]), Ok(value as u32));
    }
    for value in [1.0f32, -2.5, std::f32::consts::PI] {
        let generated = generator.generate_f32(value);
        let mut machine = Machine::new();
        machine.call(generated.code(), &[]).unwrap();
        assert_eq!(machine.single(SReg::S0), value);
    }
}
