//! Headless tree builder: builds a distance octree and prints its statistics.
//!
//! Usage: cargo run --release --bin build_tree -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>     Tree config JSON (default: built-in defaults)
//!   --terrain <PATH>    Terrain params JSON for `--field terrain`
//!   --field <KIND>      terrain | floor | sphere (default: terrain)
//!   --observer <X,Y,Z>  Observer for the initial build (default: 0,0,0)
//!   --move <X,Y,Z>      Move the observer after building and rebuild stale nodes
//!   --gpu               Mirror the tree into GPU storage buffers
//!   --slice             Print an ASCII slice of the field at z = 0
//!   --tree <DEPTH>      Print the top DEPTH levels of the tree

use std::path::PathBuf;
use std::time::Instant;

use glam::Vec3;

use sdotree::core::logging;
use sdotree::core::{Error, Result, TreeConfig};
use sdotree::field::primitives::{Floor, Sphere};
use sdotree::field::{FieldSampler, TerrainField, TerrainParams};
use sdotree::render::HeadlessContext;
use sdotree::tree::Tree;
use sdotree::tree::stats::{render_slice, render_tree};

fn main() {
    logging::init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_str_arg(&args, "--config") {
        Some(path) => TreeConfig::from_json_file(&PathBuf::from(path))?,
        None => TreeConfig::default(),
    };
    config.validate()?;
    let terrain = match parse_str_arg(&args, "--terrain") {
        Some(path) => TerrainParams::from_json_file(&PathBuf::from(path))?,
        None => TerrainParams::default(),
    };
    let field_kind = parse_str_arg(&args, "--field").unwrap_or_else(|| "terrain".to_string());
    let observer = parse_vec3_arg(&args, "--observer").unwrap_or(Vec3::ZERO);
    let moved = parse_vec3_arg(&args, "--move");
    let use_gpu = args.iter().any(|a| a == "--gpu");
    let show_slice = args.iter().any(|a| a == "--slice");
    let tree_depth = parse_u32_arg(&args, "--tree");

    let sampler: Box<dyn FieldSampler> = match field_kind.as_str() {
        "terrain" => Box::new(TerrainField::new(terrain)),
        "floor" => Box::new(Floor { height: -2.0 }),
        "sphere" => Box::new(Sphere { center: Vec3::ZERO, radius: config.root_edge() * 0.25 }),
        other => return Err(Error::Config(format!("unknown field '{}'", other))),
    };

    println!("=== Sparse Distance Octree Builder ===");
    println!("Field:     {}", field_kind);
    println!("Depth:     {}", config.max_depth);
    println!("Voxel:     {}", config.base_voxel_size);
    println!("Root edge: {}", config.root_edge());
    println!("LOD:       threshold {}, min depth {}", config.lod_threshold, config.min_lod_depth);
    println!("Workers:   {}", config.resolved_worker_count());
    println!("Observer:  {:?}", observer);
    println!();

    let mut tree = Tree::new(config, sampler)?;

    // Keep the context alive for as long as the tree mirrors into it
    let gpu = if use_gpu {
        let ctx = HeadlessContext::new_blocking()?;
        tree.attach_gpu(&ctx.device, &ctx.queue)?;
        Some(ctx)
    } else {
        None
    };

    let start = Instant::now();
    tree.build(observer)?;
    println!("Build: {:.1}ms", start.elapsed().as_secs_f64() * 1000.0);
    println!();

    let stats = tree.stats();
    println!("{}", stats);
    println!("{}", stats.histogram_text());

    if show_slice {
        let range = tree.config().root_edge().min(128.0);
        println!("=== Field slice at z = 0 ===");
        println!("{}", render_slice(tree.sampler(), 0.0, 64, range));
    }

    if let Some(depth) = tree_depth {
        println!("=== Tree (top {} levels) ===", depth);
        println!("{}", render_tree(&tree.snapshot(), depth));
    }

    if let Some(target) = moved {
        let queued = tree.move_observer(target);
        let start = Instant::now();
        let rebuilt = tree.update_stale_lods()?;
        println!(
            "Moved observer to {:?}: {} stale, {} rebuilt in {:.1}ms",
            target,
            queued,
            rebuilt,
            start.elapsed().as_secs_f64() * 1000.0
        );
        println!();
        println!("{}", tree.stats());
    }

    let report = tree.validate();
    if report.is_valid() {
        println!(
            "Validation: OK ({} nodes, {} sparsity leaves, {} LOD leaves)",
            report.nodes_visited, report.sparsity_leaves, report.lod_leaves
        );
    } else {
        println!("Validation: {} errors", report.error_count);
        for error in &report.errors {
            println!("  {}", error);
        }
    }

    if let Some(buffers) = tree.gpu_buffers() {
        println!(
            "GPU buffers: {} nodes, {} leaves",
            buffers.node_mirror().len(),
            buffers.leaf_mirror().len()
        );
    }

    tree.destroy();
    drop(gpu);
    Ok(())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_vec3_arg(args: &[String], flag: &str) -> Option<Vec3> {
    let value = parse_str_arg(args, flag)?;
    let parts: Vec<f32> = value.split(',').filter_map(|s| s.trim().parse().ok()).collect();
    match parts.as_slice() {
        [x, y, z] => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}
