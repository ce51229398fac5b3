use anyhow::Result;
use docs_translator::utils::logging;
use docs_translator::{App, AppError, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置；失败时按默认级别初始化日志，同样输出结构化记录
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            logging::init(false);
            exit_with(&e)?;
            return Ok(());
        }
    };

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行应用
    let result = match App::initialize(config).await {
        Ok(app) => app.run().await.map(|_| ()),
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        exit_with(&e)?;
    }

    Ok(())
}

/// 输出一条结构化错误记录并以非零状态退出
fn exit_with(err: &AppError) -> Result<()> {
    let record = logging::report_fatal(err);
    eprintln!("{}", serde_json::to_string(&record)?);
    std::process::exit(1);
}
