/// 命令行合并工具
///
/// 按给定顺序合并多个 FB2 文件，走与服务相同的会话流程

use clap::Parser;
use fb2_merger_lib::{logging, MergeService, MergerConfig, UserId};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "fb2-merge", about = "Merge several FB2 books into one")]
struct Args {
    /// 输出书名
    #[arg(short, long)]
    title: String,

    /// TOML 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 输出目录
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// 以 JSON 输出合并报告
    #[arg(long)]
    json: bool,

    /// 源文件，按合并顺序排列
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("错误: {}", message);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), String> {
    let mut config = MergerConfig::load(args.config.as_deref()).map_err(|e| e.to_string())?;

    // 每次运行使用自己的临时目录，不碰服务正在使用的上传目录
    let scratch = tempfile::Builder::new()
        .prefix("fb2-merge-")
        .tempdir()
        .map_err(|e| format!("无法创建临时目录: {}", e))?;
    config.upload_dir = scratch.path().to_path_buf();

    let service = MergeService::new(config).await.map_err(|e| e.to_string())?;
    let user = UserId::from("cli");

    for path in &args.files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("无法打开 {}: {}", path.display(), e))?;

        if let Err(e) = service.submit_document(&user, &name, "", file).await {
            service.cancel(&user).await.map_err(|e| e.to_string())?;
            return Err(format!("{}: {}", path.display(), e));
        }
    }

    service.begin_merge(&user).await.map_err(|e| e.to_string())?;
    let merged = match service.submit_title(&user, &args.title).await {
        Ok(merged) => merged,
        Err(e) => {
            service.cancel(&user).await.map_err(|e| e.to_string())?;
            return Err(e.to_string());
        }
    };

    let bytes = merged.read().await.map_err(|e| e.to_string())?;
    let target = args.out_dir.join(merged.file_name());
    tokio::fs::write(&target, bytes)
        .await
        .map_err(|e| format!("无法写入 {}: {}", target.display(), e))?;

    let report = merged.report().clone();
    merged.dispose().await.map_err(|e| e.to_string())?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{}", json);
    } else {
        println!("✓ {}", target.display());
        for source in &report.sources {
            println!(
                "  [{}] {} <{}> ({:?}, {} images)",
                source.index + 1,
                source.title,
                source.file_name.as_deref().unwrap_or("-"),
                source.quality,
                source.resources
            );
        }
        let degraded = report.degraded_sources().count();
        if degraded > 0 {
            println!("  {} source(s) only partially recovered", degraded);
        }
    }

    drop(service);
    scratch.close().map_err(|e| e.to_string())?;
    Ok(())
}
