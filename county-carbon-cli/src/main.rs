use anyhow::{Context, Result};
use clap::Parser;
use county_carbon::pipeline::{DEFAULT_EXPORT_CRS, DEFAULT_NODATA};
use county_carbon::writer::DEFAULT_TABLE_NAME;
use county_carbon::{CarbonStats, CarbonStatsConfig, Crs, OverlapRule, StateFilter};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Carbon raster (e.g. a total ecosystem carbon GeoTIFF)
    #[arg(long, value_name = "FILE")]
    raster: PathBuf,

    /// County boundary polygons (any OGR-readable vector file)
    #[arg(long, value_name = "FILE")]
    boundaries: PathBuf,

    /// Output SQLite database
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Table to (re)create in the output database
    #[arg(long, default_value = DEFAULT_TABLE_NAME)]
    table: String,

    /// Keep only counties in this state; repeat for several states
    #[arg(long = "state", value_name = "NAME")]
    states: Vec<String>,

    /// Raster value treated as missing
    #[arg(long, default_value_t = DEFAULT_NODATA)]
    nodata: f64,

    /// CRS of the exported WKT geometry
    #[arg(long, default_value = DEFAULT_EXPORT_CRS)]
    export_crs: String,

    /// Count every cell a county touches instead of cells whose centre it contains
    #[arg(long)]
    all_touched: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let start_time = std::time::Instant::now();

    let config = CarbonStatsConfig {
        nodata: args.nodata,
        export_crs: Crs::new(args.export_crs),
        overlap: if args.all_touched {
            OverlapRule::AllTouched
        } else {
            OverlapRule::CellCenter
        },
        ..CarbonStatsConfig::new(args.raster, args.boundaries)
    };
    let filter = (!args.states.is_empty()).then(|| StateFilter::from(args.states));

    let mut stats = CarbonStats::new(config);

    let crs = stats.read_raster().context("Reading raster failed")?;
    info!("Raster CRS: {}", crs);

    let boundaries = stats
        .process_boundaries(filter.as_ref())
        .context("Loading boundaries failed")?;
    info!("Processing {} counties", boundaries.len());

    stats
        .calculate_stats()
        .context("Computing carbon statistics failed")?;

    let destination = stats
        .export_to_sqlite(&args.output, &args.table)
        .context("Exporting to SQLite failed")?;
    println!("{}", destination.display());

    info!("Total processing time: {:?}", start_time.elapsed());

    Ok(())
}
