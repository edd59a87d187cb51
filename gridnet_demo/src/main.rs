//! Command-line walkthrough of the gridnet engine.

use std::path::Path;
use std::process;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridnet::codec::{load_any_binary, load_any_text, AnyNetwork};
use gridnet::dataset::{argmax, compute_accuracy, split_dataset};
use gridnet::eval::{compute_per_sample_performance, print_sample_diagnostics};
use gridnet::observer::NetworkAdapter;
use gridnet::prelude::*;
use gridnet::train::train_each;

type Samples = (Vec<Vec<Vec<f64>>>, Vec<Vec<Vec<f64>>>);

fn usage() -> ! {
    eprintln!("gridnet-demo: small end-to-end runs of the engine");
    eprintln!("Usage: gridnet-demo [--gpu] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  regression                  Fit y = 3x - 2 with a scalar chain");
    eprintln!("  digits                      Train a 28x28 softmax classifier on synthetic strokes");
    eprintln!("  partition                   Train two column partitions with tagged passes");
    eprintln!("  replay                      Compare static and gated replay");
    eprintln!("  surgery                     Extract a micro-network and verify it three ways");
    eprintln!("  dimension                   Fit a curve with per-neuron sub-networks");
    eprintln!("  inverse                     Recover an input from an output");
    eprintln!("  ensemble                    Train several seeds side by side");
    eprintln!("  save <path.json|path.bin>   Train briefly and save");
    eprintln!("  info <path.json|path.bin>   Load a network of any scalar type");
    eprintln!("  config <path.json>          Build a network from a NetworkConfig file");
    eprintln!("\nSet RUST_LOG=gridnet=debug for per-epoch traces.");
    process::exit(1);
}

fn parse_args() -> (bool, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut gpu = false;
    if args.first().is_some_and(|a| a == "--gpu") {
        gpu = true;
        args.remove(0);
    }
    if args.is_empty() {
        usage();
    }
    (gpu, args)
}

fn path_arg(args: &[String]) -> &Path {
    match args.get(1) {
        Some(p) => Path::new(p),
        None => usage(),
    }
}

fn maybe_gpu<T: Scalar>(net: &mut Network<T>, gpu: bool) {
    if !gpu {
        return;
    }
    match net.set_backend(Backend::Gpu) {
        Ok(()) => info!("running on {:?}", net.backend()),
        Err(e) => warn!("{}", e),
    }
}

fn regression(gpu: bool) -> Result<()> {
    let mut net = Network::<f32>::create(
        &[(1, 1), (1, 1), (1, 1)],
        &[Activation::Linear; 3],
        &[true; 3],
        Some(42),
    )?;
    maybe_gpu(&mut net, gpu);
    let xs = [-1.0, -0.5, 0.0, 0.5, 1.0, 1.5, 2.0];
    let inputs: Vec<_> = xs.iter().map(|&x| vec![vec![x]]).collect();
    let targets: Vec<_> = xs.iter().map(|&x| vec![vec![3.0 * x - 2.0]]).collect();

    let cfg = TrainConfig::new(500, 0.01).with_clip(-5.0, 5.0).with_shuffle(true);
    let report = net.train_with(&inputs, &targets, &cfg)?;
    println!("final loss {:.6}", report.final_loss().unwrap_or(f64::NAN));

    let mut expected = Vec::new();
    let mut predicted = Vec::new();
    for x in [3.0, -2.0, 0.25] {
        net.forward(&[vec![x]])?;
        let y = net.output()[0];
        println!("f({x}) = {y:.4} (want {:.4})", 3.0 * x - 2.0);
        expected.push(3.0 * x - 2.0);
        predicted.push(y);
    }
    net.evaluate(&expected, &predicted)?;
    net.print_diagnostics();
    Ok(())
}

/// Ten synthetic classes: class `c` lights row band `c` and a column band.
fn strokes(count: usize, seed: u64) -> Samples {
    let mut s = seed;
    let mut noise = move || {
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        (s % 1000) as f64 / 5000.0
    };
    let mut inputs = Vec::with_capacity(count);
    let mut targets = Vec::with_capacity(count);
    for i in 0..count {
        let class = i % 10;
        let img: Vec<Vec<f64>> = (0..28)
            .map(|y| {
                (0..28)
                    .map(|x| {
                        let on = y / 3 == class || x / 3 == 9 - class;
                        if on {
                            0.8 + noise()
                        } else {
                            noise()
                        }
                    })
                    .collect()
            })
            .collect();
        let mut t = vec![0.0; 10];
        t[class] = 1.0;
        inputs.push(img);
        targets.push(vec![t]);
    }
    (inputs, targets)
}

fn digits(gpu: bool) -> Result<()> {
    let (inputs, targets) = strokes(400, 7);
    let (tx, ty, vx, vy) = split_dataset(&inputs, &targets, 0.8)?;

    let mut net = Network::<f32>::create(
        &[(28, 28), (64, 1), (10, 1)],
        &[Activation::Linear, Activation::Relu, Activation::Softmax],
        &[true, true, true],
        Some(1),
    )?;
    maybe_gpu(&mut net, gpu);
    let cfg = TrainConfig::new(5, 0.01).with_shuffle(true).with_debug(true);
    net.train_with(&tx, &ty, &cfg)?;
    println!("validation accuracy {:.1}%", compute_accuracy(&mut net, &vx, &vy)? * 100.0);

    let mut expected = Vec::new();
    let mut predicted = Vec::new();
    let mut actual = Vec::new();
    for (x, y) in vx.iter().zip(&vy) {
        net.forward(x)?;
        let out = net.output();
        expected.push(argmax(&y[0]) as f64);
        predicted.push(argmax(&out) as f64);
        actual.push(out);
    }
    net.evaluate(&expected, &predicted)?;
    net.print_diagnostics();
    let wanted: Vec<Vec<f64>> = vy.iter().map(|t| t[0].clone()).collect();
    let reports = compute_per_sample_performance(&wanted, &actual, 0.2)?;
    print_sample_diagnostics(&reports[..reports.len().min(5)], 0.2);
    if gpu {
        net.sync_weights_to_host()?;
        println!("{:?}", net.status());
    }
    Ok(())
}

/// Two partitions of a 4-wide input: each learns the parity of its own half.
fn partition() -> Result<()> {
    let mut net = Network::<f64>::create(
        &[(4, 1), (4, 1), (2, 1)],
        &[Activation::Linear, Activation::Tanh, Activation::Sigmoid],
        &[true; 3],
        Some(3),
    )?;
    let mut samples = Vec::new();
    for bits in 0..16u32 {
        let x: Vec<f64> = (0..4).map(|b| f64::from((bits >> b) & 1)).collect();
        let left = f64::from((bits ^ (bits >> 1)) & 1);
        let right = f64::from(((bits >> 2) ^ (bits >> 3)) & 1);
        samples.push((vec![x], vec![vec![left, right]]));
    }
    for _ in 0..2000 {
        for (x, t) in &samples {
            for k in 0..2 {
                net.forward_tagged(x, 2, k)?;
                net.backward_tagged(t, 0.5, 2, k, 1.0, -1.0)?;
            }
        }
    }
    for (x, t) in samples.iter().take(4) {
        net.forward(x)?;
        println!("{:?} -> {:.3?} (want {:?})", x[0], net.output(), t[0]);
    }
    Ok(())
}

fn replay() -> Result<()> {
    let base = Network::<f32>::create(
        &[(6, 1), (12, 1), (12, 1), (3, 1)],
        &[Activation::Linear, Activation::LeakyRelu, Activation::Tanh, Activation::Softmax],
        &[true; 4],
        Some(11),
    )?;
    let input = vec![vec![0.1, 0.9, 0.3, 0.7, 0.5, 0.2]];

    let variants = [
        ("off", ReplayConfig::default()),
        ("before x2", ReplayConfig::fixed(ReplayPhase::Before, -1, 2)),
        ("after x1", ReplayConfig::fixed(ReplayPhase::After, 0, 1)),
        ("entropy gate", ReplayConfig::gated(ReplayPhase::Before, -1, Gate::Entropy, 4)),
    ];
    for (name, cfg) in variants {
        let mut net = base.clone();
        net.set_replay(2, cfg)?;
        net.forward(&input)?;
        net.forward(&input)?;
        println!("{name:<13} {:.4?}", net.output());
    }
    Ok(())
}

fn surgery() -> Result<()> {
    let mut net = Network::<f64>::create(
        &[(3, 1), (8, 1), (6, 1), (2, 1)],
        &[Activation::Linear, Activation::Relu, Activation::Tanh, Activation::Softmax],
        &[true; 4],
        Some(5),
    )?;
    let inputs: Vec<Vec<Vec<f64>>> = (0..8)
        .map(|i| vec![vec![i as f64 / 8.0, 1.0 - i as f64 / 8.0, 0.5]])
        .collect();
    let mut micro = net.extract_micro_network(2)?;
    let report = micro.verify_three_way(&mut net, &inputs[0], 1e-10)?;
    println!(
        "three-way: equivalent={} max deviation {:e}",
        report.equivalent, report.max_deviation
    );
    let micro = net.network_surgery(2, &inputs, 1e-10)?;
    println!(
        "surgery verified; micro-network has {} layers from layer {}",
        micro.network().num_layers(),
        micro.source_layer()
    );
    Ok(())
}

fn dimension() -> Result<()> {
    let base = Network::<f64>::create(
        &[(1, 1), (4, 1), (1, 1)],
        &[Activation::Linear, Activation::Tanh, Activation::Linear],
        &[true; 3],
        Some(13),
    )?;
    let inputs: Vec<Vec<Vec<f64>>> = (0..16).map(|i| vec![vec![i as f64 / 8.0 - 1.0]]).collect();
    let targets: Vec<Vec<Vec<f64>>> = inputs.iter().map(|x| vec![vec![x[0][0] * x[0][0]]]).collect();
    let sub = [(1, 1), (3, 1), (1, 1)];
    let acts = [Activation::Linear, Activation::Tanh, Activation::Linear];

    for (name, options) in [
        ("per neuron", Some(DimensionOptions::default())),
        ("shared", Some(DimensionOptions::shared().with_init(InitMethod::Xavier))),
        ("plain", None),
    ] {
        let mut net = base.clone();
        if let Some(options) = options {
            net.set_layer_dimension(1, &sub, &acts, &[true; 3], options)?;
        }
        net.train(&inputs, &targets, 300, 0.02, false, 5.0, -5.0)?;
        let mse = inputs
            .iter()
            .zip(&targets)
            .map(|(x, t)| -> Result<f64> {
                net.forward(x)?;
                Ok((net.output()[0] - t[0][0]).powi(2))
            })
            .sum::<Result<f64>>()?
            / inputs.len() as f64;
        println!("{name:<11} mse {mse:.5}");
    }
    Ok(())
}

fn inverse() -> Result<()> {
    let mut net = Network::<f64>::create(&[(4, 1); 3], &[Activation::Linear; 3], &[true; 3], Some(9))?;
    let x = vec![vec![0.2, 0.4, 0.6, 0.8]];
    net.forward(&x)?;
    let y = net.output_grid();
    println!("exact:     {:.6?}", net.reverse_exact(&y)?[0]);
    println!("layerwise: {:.6?}", net.reverse_layer_by_layer(&y)?[0]);
    let found = net.reverse_iterative(&y, IterativeInverse::new(500))?;
    println!("iterative: {:.6?} (loss {:e})", found.input[0], found.loss);
    Ok(())
}

fn ensemble() -> Result<()> {
    let (inputs, targets) = strokes(100, 3);
    let mut nets: Vec<Network<f32>> = (0..4)
        .map(|seed| {
            Network::create(
                &[(28, 28), (16, 1), (10, 1)],
                &[Activation::Linear, Activation::Relu, Activation::Softmax],
                &[true; 3],
                Some(seed),
            )
        })
        .collect::<Result<_>>()?;
    let cfg = TrainConfig::new(3, 0.01);
    for (i, r) in train_each(&mut nets, &inputs, &targets, &cfg).into_iter().enumerate() {
        let r = r?;
        println!("seed {i}: loss {:.4}", r.final_loss().unwrap_or(f64::NAN));
    }
    Ok(())
}

fn save(path: &Path) -> Result<()> {
    let mut net = Network::<i16>::create(
        &[(4, 1), (6, 1), (2, 1)],
        &[Activation::Linear, Activation::Relu, Activation::Linear],
        &[true; 3],
        Some(2),
    )?;
    let inputs = vec![vec![vec![1.0, 2.0, 3.0, 4.0]]];
    let targets = vec![vec![vec![10.0, -10.0]]];
    net.train(&inputs, &targets, 10, 0.01, false, 2, -2)?;
    if path.extension().is_some_and(|e| e == "json") {
        net.save_text(path)?;
    } else {
        net.save_binary(path)?;
    }
    println!("saved {} bytes of binary image", net.image_size_bytes()?);
    Ok(())
}

fn describe(any: &AnyNetwork) {
    println!("{} network with {} layers", any.scalar_type(), any.num_layers());
    if let AnyNetwork::F32(n) = any {
        for l in NetworkAdapter::new(n).snapshot().layers {
            println!("  {:?}", l);
        }
    }
}

fn show(path: &Path) -> Result<()> {
    let any = if path.extension().is_some_and(|e| e == "json") {
        load_any_text(path)?
    } else {
        load_any_binary(path)?
    };
    describe(&any);
    Ok(())
}

fn from_config(path: &Path, gpu: bool) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let mut config = NetworkConfig::from_json(&text)?;
    if gpu {
        config = config.with_backend(Backend::Gpu);
    }
    let mut net = Network::<f32>::new(config)?;
    let (w, h) = net.input_shape();
    net.forward(&vec![vec![0.5; w]; h])?;
    let snap = NetworkAdapter::new(&net).snapshot();
    println!("{:?}", snap.backend);
    for l in &snap.layers {
        match serde_json::to_string(l) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("{}", e),
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (gpu, args) = parse_args();

    let result = match args[0].as_str() {
        "regression" => regression(gpu),
        "digits" => digits(gpu),
        "partition" => partition(),
        "replay" => replay(),
        "surgery" => surgery(),
        "dimension" => dimension(),
        "inverse" => inverse(),
        "ensemble" => ensemble(),
        "save" => save(path_arg(&args)),
        "info" => show(path_arg(&args)),
        "config" => from_config(path_arg(&args), gpu),
        _ => usage(),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
