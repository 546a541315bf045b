//! 레코드 수집 서버의 클라이언트 CLI.
//!
//! 'numbers' 서브커맨드는 무작위 레코드 스트림을 전송하고, 'terminate' 서브커맨드는
//! 서버 전체를 셧다운시키는 제어 토큰을 전송한다.

use numbers_server::{client, frame, DEFAULT_ADDRESS, DEFAULT_PORT};

use rand::Rng;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
    name = "numbers-cli",
    version = env!("CARGO_PKG_VERSION"),
    about = "A record stream client"
)]
struct Cli {
    #[structopt(subcommand)]
    command: Command,

    #[structopt(name = "hostname", long = "--host", default_value = DEFAULT_ADDRESS)]
    host: String,

    #[structopt(name = "port", long = "--port", default_value = DEFAULT_PORT)]
    port: String,
}

#[derive(StructOpt)]
enum Command {
    /// 무작위로 생성한 레코드를 서버가 커넥션을 닫을 때까지 전송한다.
    Numbers {
        /// 전송할 레코드 수. 지정하지 않으면 무제한.
        #[structopt(long = "count")]
        count: Option<u64>,
    },
    /// 'terminate' 토큰을 전송하여 서버를 셧다운한다.
    Terminate,
}

/// CLI 툴의 진입점.
///
/// '[tokio::main]' 어노테이션은 이 함수의 호출 시 Tokio 런타임을 시작하도록 하는
/// 시그널을 보낸다. 함수 본문은 새롭게 가동되는 런타임 안에서 실행된다.
///
/// 여기서 사용하는 'flavor = "current_thread"'는 백그라운드 쓰레드를 가동하지 않기
/// 위함이다. 멀티쓰레드 대신 가벼움을 취하는 편이 CLI 툴의 유즈케이스에 맞는다.
#[tokio::main(flavor = "current_thread")]
async fn main() -> numbers_server::Result<()> {
    // 로깅을 활성화한다.
    tracing_subscriber::fmt::try_init()?;

    // 커맨드라인 아규먼트를 파싱한다.
    let cli = Cli::from_args();

    // 연결할 원격 주소를 가져온다.
    let addr = format!("{}:{}", cli.host, cli.port);

    // 연결을 수립한다.
    let mut client = client::connect(&addr).await?;

    // 요청 커맨드를 수행한다.
    match cli.command {
        Command::Numbers { count } => {
            println!("Connected. Sending numbers...");

            let mut rng = rand::thread_rng();
            let mut sent = 0u64;

            while count.map_or(true, |count| sent < count) {
                let record = rng.gen_range(0..=frame::MAX_RECORD);

                if client.send(record).await.is_err() {
                    // 서버가 커넥션을 닫았다 (캡 초과 거절 혹은 셧다운).
                    println!("Connection closed remotely.");
                    break;
                }

                sent += 1;
            }
        }
        Command::Terminate => {
            println!("Connected. Sending 'terminate'...");

            client.terminate().await?;

            println!("Connection closed remotely.");
        }
    }

    Ok(())
}
