//! 레코드 수집 서버.
//!
//! 이 파일은 이 라이브러리에 구현된 서버의 진입점이다. 커맨드라인을 파싱하고
//! 아규먼트를 'numbers_server::server'에 전달한다.
//!
//! 아규먼트 파싱에는 'structopt' crate를 사용한다.

use numbers_server::{
    server, DEFAULT_ADDRESS, DEFAULT_LOG_FILENAME, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
    DEFAULT_REPORT_PERIOD_SECS,
};

use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
pub async fn main() -> numbers_server::Result<()> {
    // 로깅을 활성화한다.
    // 자세한 내용: https://docs.rs/tracing
    tracing_subscriber::fmt::try_init()?;

    let cli = Cli::from_args();

    let address = cli.address.as_deref().unwrap_or(DEFAULT_ADDRESS);
    let port = cli.port.as_deref().unwrap_or(DEFAULT_PORT);

    let config = server::Config {
        max_connections: cli.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
        log_filename: cli
            .log_filename
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILENAME)),
        report_period: Duration::from_secs(
            cli.report_period_seconds.unwrap_or(DEFAULT_REPORT_PERIOD_SECS),
        ),
    };

    let listener = TcpListener::bind(&format!("{}:{}", address, port)).await?;

    server::run(listener, config, signal::ctrl_c()).await
}

#[derive(StructOpt)]
#[structopt(
    name = "numbers-server",
    version = env!("CARGO_PKG_VERSION"),
    about = "A record deduplication server"
)]
struct Cli {
    /// 바인딩할 호스트 주소
    #[structopt(long = "address")]
    address: Option<String>,

    /// 리스닝할 TCP 포트
    #[structopt(long = "port")]
    port: Option<String>,

    /// 동시 커넥션 수의 하드 캡
    #[structopt(long = "max-connections")]
    max_connections: Option<usize>,

    /// 유니크 레코드가 기록되는 로그 파일 경로
    #[structopt(long = "log-filename", parse(from_os_str))]
    log_filename: Option<PathBuf>,

    /// 리포트 주기 (초)
    #[structopt(long = "report-period-seconds")]
    report_period_seconds: Option<u64>,
}
