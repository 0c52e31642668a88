//! Command line front end for the kernel generators.
//!
//! Generates one kernel, prints its disassembly or size, optionally writes it to an
//! ARM ELF object and optionally checks it in the host simulator.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{info, warn};

use mvejit::armv81m::{disassemble, Generated, KernelAbi};
use mvejit::config::{GemmConfig, GemmShape, DEFAULT_CAPACITY};
use mvejit::core::Fault;
use mvejit::kernels::{
    ConstantGenerator, GemmGenerator, PeakGenerator, StreamGenerator, TriadGenerator,
};
use mvejit::{elf, reference, sim};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate Thumb-2/MVE kernels for Armv8.1-M")]
struct Opts {
    /// Instruction buffer size in half-words
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,
    /// Print the disassembly
    #[arg(long)]
    disasm: bool,
    /// Write the kernel to an ELF relocatable object
    #[arg(long)]
    elf: Option<PathBuf>,
    /// Run the kernel in the simulator and compare with the reference (gemm, triad)
    #[arg(long)]
    verify: bool,
    #[command(subcommand)]
    kernel: KernelCmd,
}

#[derive(Subcommand, Debug)]
enum KernelCmd {
    /// C += A * B for a fixed column-major shape
    Gemm {
        #[arg(short)]
        m: u32,
        #[arg(short)]
        k: u32,
        #[arg(short)]
        n: u32,
        #[arg(long)]
        lda: Option<u32>,
        #[arg(long)]
        ldb: Option<u32>,
        #[arg(long)]
        ldc: Option<u32>,
        /// Rows per m-loop tile
        #[arg(long, default_value_t = GemmConfig::default().tile_m)]
        tile_m: u32,
        /// Columns per n-loop tile
        #[arg(long, default_value_t = GemmConfig::default().tile_n)]
        tile_n: u32,
    },
    /// out[i] = a[i] * scalar + b[i]
    Triad {
        #[arg(long, default_value_t = 3.0)]
        scalar: f32,
    },
    /// Unrolled sequential vector loads
    Stream {
        #[arg(long, default_value_t = 8)]
        unroll: u32,
    },
    /// Independent VFMA chains
    Peak {
        #[arg(long, default_value_t = 24)]
        fma_count: u32,
    },
    /// Function returning a constant
    Constant {
        #[arg(allow_negative_numbers = true)]
        value: String,
        /// Return the value as a float in s0
        #[arg(long)]
        float: bool,
    },
}

/// A generated kernel copied out of the generator's buffer.
struct Output {
    name: &'static str,
    code: Vec<u16>,
    faults: Vec<Fault>,
}

fn output<F: KernelAbi>(name: &'static str, generated: &Generated<'_, F>) -> Output {
    Output {
        name,
        code: generated.code().to_vec(),
        faults: generated.faults().to_vec(),
    }
}

fn generate(opts: &Opts, buffer: &mut [u16]) -> Result<Output, Box<dyn std::error::Error>> {
    Ok(match &opts.kernel {
        KernelCmd::Gemm {
            m,
            k,
            n,
            lda,
            ldb,
            ldc,
            tile_m,
            tile_n,
        } => {
            let shape = GemmShape::new(*m, *k, *n).with_leading_dimensions(
                lda.unwrap_or(*m),
                ldb.unwrap_or(*k),
                ldc.unwrap_or(*m),
            );
            let config = GemmConfig {
                tile_m: *tile_m,
                tile_n: *tile_n,
                ..GemmConfig::default()
            };
            let mut generator = GemmGenerator::with_config(buffer, config)?;
            let generated = generator.generate(shape);
            output("gemm", &generated)
        }
        KernelCmd::Triad { scalar } => {
            let mut generator = TriadGenerator::new(buffer)?;
            let generated = generator.generate(*scalar);
            output("triad", &generated)
        }
        KernelCmd::Stream { unroll } => {
            let mut generator = StreamGenerator::new(buffer)?;
            let generated = generator.generate(*unroll);
            output("stream", &generated)
        }
        KernelCmd::Peak { fma_count } => {
            let mut generator = PeakGenerator::new(buffer)?;
            let generated = generator.generate(*fma_count);
            output("peak", &generated)
        }
        KernelCmd::Constant { value, float: true } => {
            let mut generator = ConstantGenerator::new(buffer)?;
            output("constant", &generator.generate_f32(value.parse()?))
        }
        KernelCmd::Constant { value, float: false } => {
            let mut generator = ConstantGenerator::new(buffer)?;
            output("constant", &generator.generate(value.parse()?))
        }
    })
}

fn verify(opts: &Opts, code: &[u16]) -> Result<(), Box<dyn std::error::Error>> {
    match &opts.kernel {
        KernelCmd::Gemm {
            m,
            k,
            n,
            lda,
            ldb,
            ldc,
            ..
        } => {
            let shape = GemmShape::new(*m, *k, *n).with_leading_dimensions(
                lda.unwrap_or(*m),
                ldb.unwrap_or(*k),
                ldc.unwrap_or(*m),
            );
            let a = reference::dyadic(shape.a_len(), 1);
            let b = reference::dyadic(shape.b_len(), 2);
            let c = reference::dyadic(shape.c_len(), 3);
            let run = sim::run_gemm(code, &shape, &a, &b, &c)?;
            let mut expected = c;
            reference::gemm(&shape, &a, &b, &mut expected);
            let mismatches = run
                .c
                .iter()
                .zip(&expected)
                .filter(|(got, want)| got.to_bits() != want.to_bits())
                .count();
            println!(
                "verify: {} instructions, {mismatches} mismatches, canary {}, callee-saved {}",
                run.steps,
                if run.canary_intact { "intact" } else { "clobbered" },
                if run.callee_saved_intact { "restored" } else { "clobbered" },
            );
            if mismatches > 0 || !run.canary_intact || !run.callee_saved_intact {
                return Err("simulated kernel disagrees with the reference".into());
            }
        }
        KernelCmd::Triad { scalar } => {
            let len = 37;
            let a = reference::dyadic(len, 4);
            let b = reference::dyadic(len, 5);
            let out = sim::run_triad(code, &a, &b, len)?;
            let good = (0..len).all(|i| out[i] == a[i].mul_add(*scalar, b[i]));
            println!("verify: triad over {len} elements {}", if good { "ok" } else { "wrong" });
            if !good {
                return Err("simulated triad disagrees with the reference".into());
            }
        }
        _ => warn!("--verify only checks gemm and triad kernels"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let opts = Opts::parse();
    let mut buffer = vec![0u16; opts.capacity];
    let output = generate(&opts, &mut buffer)?;

    for fault in &output.faults {
        eprintln!("fault: {fault}");
    }
    info!("{}: {} half-words", output.name, output.code.len());
    println!("{}: {} bytes", output.name, output.code.len() * 2);
    if opts.disasm {
        for line in disassemble(&output.code) {
            println!("{line}");
        }
    }
    if let Some(path) = &opts.elf {
        let bytes = elf::write_object(&[(output.name, output.code.as_slice())])?;
        fs::write(path, bytes)?;
        println!("wrote {}", path.display());
    }
    if opts.verify {
        verify(&opts, &output.code)?;
    }
    if output.faults.iter().any(Fault::is_fatal) {
        std::process::exit(1);
    }
    Ok(())
}
