//! Media Catalog CLI
//!
//! Builds and maintains a content-addressed catalog of a media directory.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use media_catalog::{
    BackgroundScanner, CatalogConfig, CatalogResult, CatalogStore, MediaRecord, PassMode, PassReport, Reconciler,
    SettingsManager, SqliteCatalog, TaggingModel,
};

const ABOUT: &str = r#"
Media Catalog - 媒体文件内容寻址目录

使用示例:
  media_catalog scan -r /photos                    首次建立目录
  media_catalog scan -r /photos -i                 增量同步（检测重命名、修改、删除）
  media_catalog scan -r /photos --tagging dominant-color
  media_catalog watch -r /photos --interval 300    后台定时同步
  media_catalog query -r /photos --date 2023-06-01
  media_catalog query -r /photos --city Paris --json
"#;

/// Content-addressed media catalog
#[derive(Parser)]
#[command(name = "media_catalog")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 显示帮助信息
    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help, global = true)]
    help: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// 同步目录与文件系统
    #[command(about = "同步目录与文件系统")]
    Scan {
        /// 媒体根目录
        #[arg(short = 'r', long, help = "媒体根目录")]
        root: PathBuf,

        /// 执行增量同步
        #[arg(short = 'i', long, help = "增量同步：校验已有记录并清理已删除文件")]
        incremental: bool,

        /// 数据库文件路径
        #[arg(short = 'd', long, help = "SQLite数据库文件路径（默认在根目录下）")]
        db: Option<PathBuf>,

        /// 并行线程数（0 = 自动检测）
        #[arg(short = 't', long, default_value = "0", help = "并行线程数，0表示自动检测")]
        threads: usize,

        /// 城市列表 CSV
        #[arg(long, help = "城市列表CSV（city,lat,lng,country）")]
        cities: Option<PathBuf>,

        /// 标签模型
        #[arg(long, default_value = "off", help = "标签模型: off | dominant-color")]
        tagging: TaggingModel,

        /// 输出进度到 stderr
        #[arg(long, help = "以JSON行格式向stderr输出进度")]
        progress: bool,

        /// 以 JSON 格式输出结果
        #[arg(long, help = "输出JSON格式的同步结果")]
        json: bool,
    },

    /// 后台定时同步
    #[command(about = "首次同步后在后台定时增量同步；回车立即同步，输入 quit 退出")]
    Watch {
        /// 媒体根目录
        #[arg(short = 'r', long, help = "媒体根目录")]
        root: PathBuf,

        /// 数据库文件路径
        #[arg(short = 'd', long, help = "SQLite数据库文件路径（默认在根目录下）")]
        db: Option<PathBuf>,

        /// 同步间隔（秒）
        #[arg(long, help = "同步间隔秒数，0表示仅手动触发（覆盖设置文件）")]
        interval: Option<u64>,

        /// 设置文件
        #[arg(long, help = "设置文件路径（JSON）")]
        settings: Option<PathBuf>,

        /// 并行线程数（0 = 自动检测）
        #[arg(short = 't', long, default_value = "0", help = "并行线程数，0表示自动检测")]
        threads: usize,

        /// 城市列表 CSV
        #[arg(long, help = "城市列表CSV（city,lat,lng,country）")]
        cities: Option<PathBuf>,
    },

    /// 查询目录
    #[command(about = "按拍摄日期或地点查询目录")]
    Query {
        /// 媒体根目录
        #[arg(short = 'r', long, help = "媒体根目录")]
        root: PathBuf,

        /// 数据库文件路径
        #[arg(short = 'd', long, help = "SQLite数据库文件路径（默认在根目录下）")]
        db: Option<PathBuf>,

        /// 拍摄日期
        #[arg(long, conflicts_with_all = ["from", "to", "city"], help = "拍摄日期 YYYY-MM-DD（UTC）")]
        date: Option<NaiveDate>,

        /// 起始日期
        #[arg(long, requires = "to", help = "起始日期 YYYY-MM-DD（含）")]
        from: Option<NaiveDate>,

        /// 结束日期
        #[arg(long, requires = "from", help = "结束日期 YYYY-MM-DD（含）")]
        to: Option<NaiveDate>,

        /// 城市
        #[arg(long, help = "城市名称")]
        city: Option<String>,

        /// 国家
        #[arg(long, requires = "city", help = "国家名称")]
        country: Option<String>,

        /// 以 JSON 格式输出结果
        #[arg(long, help = "输出JSON格式的查询结果")]
        json: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Scan {
            root,
            incremental,
            db,
            threads,
            cities,
            tagging,
            progress,
            json,
        }) => {
            let mut builder = CatalogConfig::builder()
                .storage_root(root)
                .num_threads(threads)
                .tagging_model(tagging)
                .show_progress(progress);
            if let Some(db) = db {
                builder = builder.db_path(db);
            }
            if let Some(cities) = cities {
                builder = builder.cities_csv(cities);
            }
            let mode = if incremental {
                PassMode::Incremental
            } else {
                PassMode::Initial
            };
            run_scan(builder.build(), mode, json)
        }
        Some(Commands::Watch {
            root,
            db,
            interval,
            settings,
            threads,
            cities,
        }) => {
            let settings_path = settings.unwrap_or_else(|| root.join("media_catalog.settings.json"));
            run_watch(root, db, interval, &settings_path, threads, cities)
        }
        Some(Commands::Query {
            root,
            db,
            date,
            from,
            to,
            city,
            country,
            json,
        }) => run_query(&root, db, date, from.zip(to), city, country, json),
        None => {
            // 没有子命令时显示帮助
            println!("{}", ABOUT);
            println!("使用 'media_catalog scan -h' 查看同步命令的详细帮助");
            println!("使用 'media_catalog --help' 查看完整帮助信息");
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_scan(config: CatalogConfig, mode: PassMode, json: bool) -> CatalogResult<()> {
    info!("Root: {:?}", config.storage_root);
    info!("Mode: {}", mode.as_str());
    info!(
        "Threads: {}",
        if config.num_threads == 0 {
            "auto".to_string()
        } else {
            config.num_threads.to_string()
        }
    );
    info!("Tagging: {}", config.tagging_model.as_str());

    let reconciler = Reconciler::open(config)?;
    let report = reconciler.run(mode)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &PassReport) {
    println!("Pass completed ({}):", report.mode.as_str());
    println!("  Media files: {}", report.files_seen);
    println!("  Unchanged: {}", report.unchanged);
    println!("  Created: {}", report.records_created);
    println!("  Updated: {}", report.records_updated);
    println!("  Renamed: {}", report.records_renamed);
    println!("  Replaced: {}", report.records_replaced);
    println!("  Deleted: {}", report.records_deleted);
    println!("  Duplicates skipped: {}", report.duplicates_skipped);
    println!(
        "  Thumbnails: {} generated, {} deleted, {} migrated",
        report.thumbnails_generated, report.thumbnails_deleted, report.thumbnails_migrated
    );
    println!("  Errors: {}", report.error_count());
    println!("  Warnings: {}", report.warnings.len());
    if report.cancelled {
        println!("  Cancelled: yes");
    }
    println!("  Duration: {}ms", report.duration_ms);
}

fn run_watch(
    root: PathBuf,
    db: Option<PathBuf>,
    interval: Option<u64>,
    settings_path: &Path,
    threads: usize,
    cities: Option<PathBuf>,
) -> CatalogResult<()> {
    let mut settings = SettingsManager::load(settings_path)?;
    let interval = Duration::from_secs(interval.unwrap_or(settings.get().rescan_interval_secs));
    info!("Settings: {:?}", settings.path());

    let mut builder = CatalogConfig::builder()
        .storage_root(root)
        .num_threads(threads)
        .tagging_model(settings.get().tagging_model);
    if let Some(db) = db {
        builder = builder.db_path(db);
    }
    if let Some(cities) = cities {
        builder = builder.cities_csv(cities);
    }

    let reconciler = Arc::new(Reconciler::open(builder.build())?);
    print_report(&reconciler.run(PassMode::Initial)?);

    let scanner = BackgroundScanner::spawn(reconciler, interval)?;
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "" | "scan" => {
                scanner.trigger();
            }
            "quit" | "exit" => break,
            other => match other.strip_prefix("interval ").map(|s| s.trim().parse::<u64>()) {
                Some(Ok(secs)) => {
                    scanner.set_interval(Duration::from_secs(secs));
                    if let Err(e) = settings.update(|s| s.rescan_interval_secs = secs) {
                        warn!("Interval changed but not saved: {}", e);
                    }
                }
                _ => println!("Commands: <enter> | scan | interval <secs> | quit"),
            },
        }
    }
    info!("Stopping after {} background passes", scanner.passes_completed());
    scanner.shutdown();
    Ok(())
}

fn run_query(
    root: &Path,
    db: Option<PathBuf>,
    date: Option<NaiveDate>,
    range: Option<(NaiveDate, NaiveDate)>,
    city: Option<String>,
    country: Option<String>,
    json: bool,
) -> CatalogResult<()> {
    let config = CatalogConfig::new(root.to_path_buf());
    let catalog = SqliteCatalog::open(&db.unwrap_or_else(|| config.effective_db_path()))?;

    let records: Vec<MediaRecord> = if let Some(date) = date {
        catalog.list_by_capture_date(date)?
    } else if let Some((from, to)) = range {
        let start = day_start(from);
        let end = day_start(to) + 86_399;
        catalog.list_by_capture_range(start, end)?
    } else if let Some(city) = city {
        catalog.list_by_location(&city, country.as_deref())?
    } else {
        catalog.list_all()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            let place = match (&record.city, &record.country) {
                (Some(city), Some(country)) => format!("{}, {}", city, country),
                _ => "-".to_string(),
            };
            let taken = chrono::DateTime::from_timestamp(record.capture_timestamp, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| record.capture_timestamp.to_string());
            println!("{}  {}  {}  {}", taken, record.relative_path, place, record.mime_type);
        }
        println!("{} records", records.len());
    }
    Ok(())
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}
