//! 레코드 수집 서버 구현.
//!
//! 인바운드 커넥션을 수신하는 비동기 'run' 함수를 제공한다.
//! 커넥션마다 태스크를 가동한다.

use crate::{Connection, Db, Frame, Reporter, Shutdown, ShutdownRequest};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time;
use tracing::{debug, error, info, instrument};

/// 서버 구성. 각 필드의 기본값은 크레이트 루트의 'DEFAULT_*' 상수이다.
#[derive(Clone, Debug)]
pub struct Config {
    /// 동시 커넥션 수의 하드 캡. 큐의 크기가 아니라 절대 한도이다.
    pub max_connections: usize,

    /// 유니크 레코드가 기록되는 로그 파일 경로. 시작 시 truncate된다.
    pub log_filename: PathBuf,

    /// 리포트 주기.
    pub report_period: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_connections: crate::DEFAULT_MAX_CONNECTIONS,
            log_filename: PathBuf::from(crate::DEFAULT_LOG_FILENAME),
            report_period: Duration::from_secs(crate::DEFAULT_REPORT_PERIOD_SECS),
        }
    }
}

/**
 * 서버 리스너 상태. 'run' 호출 안에서 생성된다. TCP 리스닝과 어드미션을 수행하고,
 * 수락된 커넥션마다 per-connection 상태('Handler')를 초기화한다.
 */
struct Listener {
    /**
     * 공유 상태 핸들.
     *
     * 중복 제거 인덱스와 주기 카운터, 로그 버퍼를 가진다.
     *
     * 'Arc'로 감싼 래퍼(wrapper)이다. clone하여 각 커넥션의 상태('Handler')로
     * 전달된다.
     */
    db: Db,

    // 'run' 호출자가 제공하는 TCP 리스너.
    listener: TcpListener,

    /**
     * 최대 커넥션 수를 제한한다.
     *
     * 커넥션의 최대 개수를 제한하기 위해 'Semaphore(이하 세마포어)'를 사용한다.
     * 커넥션을 수락한 직후 permit 획득을 시도하고, 획득하지 못하면 그 소켓을 읽기도
     * 쓰기도 전에 즉시 닫는다. 캡은 대기 큐가 아니라 하드 한도이다.
     *
     * 핸들러가 커넥션 처리를 마치면 permit을 세마포어에 반환한다.
     */
    limit_connections: Arc<Semaphore>,

    /**
     * 셧다운을 모든 유효한 커넥션에게 전파한다.
     *
     * 초기 'shutdown' 트리거는 'run' 호출자가 제공한다. 유효한 커넥션들을
     * graceful하게 종료하는 역할은 서버의 몫이다. 커넥션 태스크가 가동되면 이
     * 채널을 구독한 'Shutdown' 핸들이 함께 전달된다. graceful 셧다운이 시작되면
     * 정지 플래그가 'true'로 쓰이고, 구독 중인 모든 태스크가 깨어나 안전한 종료
     * 상태에 도달한 뒤 태스크를 완료한다.
     */
    notify_shutdown: watch::Sender<bool>,

    /**
     * graceful 셧다운 중 클라이언트 커넥션의 처리 완료를 기다리는 과정에 사용된다.
     *
     * 모든 'Sender' 핸들이 범위를 벗어나면 Tokio 채널이 닫힌다. 채널이 닫히면
     * 수신자는 'None'을 수신한다. 이 방식으로 모든 커넥션 핸들러(그리고 리포터)가
     * 작업을 마쳤음을 감지한다. 핸들러가 초기화될 때 'shutdown_complete_tx'의
     * clone이 할당되며, 리스너 셧다운 시 리스너가 보유한 sender를 drop한다. 모든
     * 태스크가 완료되면 남은 'Sender' clone도 전부 drop되어
     * 'shutdown_complete_rx.recv()'가 'None'으로 완료된다. 이 시점에 서버
     * 프로세스를 안전하게 종료할 수 있다.
     */
    shutdown_complete_rx: mpsc::Receiver<()>,
    shutdown_complete_tx: mpsc::Sender<()>,

    /**
     * 전체 셧다운을 요청하는 핸들. 핸들러마다 clone이 전달된다.
     *
     * 'terminate' 토큰을 수신한 워커는 공유 상태를 직접 해체하지 않는다. 이 핸들로
     * 시그널 하나를 발행할 뿐이고, 셧다운 절차는 'run'이 수행한다.
     */
    shutdown_request: ShutdownRequest,
}

/**
 * 각 커넥션의 핸들러. 'connection'으로부터 레코드 프레임을 읽어 'db'에 적용한다.
 */
struct Handler {
    /**
     * 공유 상태 핸들.
     *
     * 'connection'으로부터 레코드를 수신하면 'Db::ingest'로 적용한다. 룩업과 카운터
     * 갱신, 로그 버퍼 추가는 전부 'db'의 락 안에서 이루어진다.
     */
    db: Db,

    /**
     * 레코드 프로토콜 인코더/디코더를 갖춘 TCP 커넥션.
     * 인코더/디코더는 버퍼링된 'TcpStream'을 사용하여 구현되어 있다.
     *
     * 'Listener'가 인바운드 커넥션을 수신하면 'TcpStream'을 'Connection::new'에
     * 전달한다. 'Connection'은 핸들러에게 "frame" 수준의 연산을 가능하게 하며,
     * 바이트 레벨 프로토콜 파싱의 세부사항은 'Connection'에 캡슐화한다.
     */
    connection: Connection,

    /**
     * 최대 커넥션 세마포어.
     *
     * 핸들러 drop 시 이 세마포어에 permit을 반환한다. 캡에 도달해 새 커넥션을
     * 거절하던 리스너는 permit이 돌아오는 즉시 다시 수락을 허용한다.
     */
    limit_connections: Arc<Semaphore>,

    /**
     * 셧다운 전파를 받는다.
     *
     * 'Listener'의 sender와 페어링된 'watch' 채널의 구독이다. 커넥션 핸들러는
     * 피어가 연결을 끊거나 **혹은** 셧다운 전파를 받을 때까지 커넥션의 레코드를
     * 처리한다.
     */
    shutdown: Shutdown,

    // 'terminate' 토큰 수신 시 전체 셧다운을 요청하는 핸들.
    shutdown_request: ShutdownRequest,

    // 직접 사용하지 않는다. 'Handler' drop 시 셧다운 완료 대기자에게 알린다.
    _shutdown_complete: mpsc::Sender<()>,
}

/**
 * 레코드 수집 서버를 가동한다.
 *
 * 로그 파일을 truncate 모드로 열고, 최초의 0값 리포트를 출력하고, 주기 리포터를
 * 가동한 뒤, 리스너로부터 커넥션을 수락한다. 커넥션 핸들링 태스크를 각 커넥션 당
 * 하나씩 가동한다. 서버는 'shutdown' future가 완료되거나, 어느 커넥션에서든
 * 'terminate' 토큰이 수신될 때까지 가동한다. 즉 서버의 graceful 셧다운까지이다.
 *
 * 'tokio::signal::ctrl_c()'를 'shutdown' 아규먼트로 사용할 수 있다. 이것은 SIGINT
 * 시그널이 될 것이다.
 */
pub async fn run(listener: TcpListener, config: Config, shutdown: impl Future) -> crate::Result<()> {
    /*
    제공된 'shutdown' future가 완료되면, 반드시 셧다운을 모든 유효 커넥션들에게
    전파해야 한다. 이 작업에는 정지 플래그를 담는 'watch' 채널을 사용한다. 아래
    호출은 페어의 초기 수신자를 무시하고, 수신자가 필요한 곳에서 sender의
    subscribe() 메서드로 하나씩 생성한다.
    */
    let (notify_shutdown, _) = watch::channel(false);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

    /*
    워커와 리포터가 전체 셧다운을 요청하는 경로. 'terminate' 토큰 수신과 로그 flush
    실패가 여기로 모인다.
    */
    let (shutdown_request_tx, mut shutdown_request_rx) = ShutdownRequest::channel();

    let db = Db::new();

    // 로그 파일을 truncate하여 연다. 이전 가동의 로그는 복구하지 않는다.
    let logfile = File::create(&config.log_filename).await?;

    let mut reporter = Reporter::new(
        db.clone(),
        logfile,
        config.report_period,
        Shutdown::new(notify_shutdown.subscribe()),
        shutdown_request_tx.clone(),
        shutdown_complete_tx.clone(),
    );

    // 최초의 0값 리포트 라인은 커넥션 수락이 시작되기 전에 출력한다.
    reporter.report().await?;

    // 주기 리포터를 가동한다.
    tokio::spawn(async move {
        reporter.run().await;
    });

    // 리스너 상태를 초기화한다.
    let mut server = Listener {
        listener,
        db,
        limit_connections: Arc::new(Semaphore::new(config.max_connections)),
        notify_shutdown,
        shutdown_complete_tx,
        shutdown_complete_rx,
        shutdown_request: shutdown_request_tx,
    };

    /*
    서버 가동과 'shutdown' 시그널 수신, 그리고 셧다운 요청 채널의 수신을 동시에
    수행한다. 서버 태스크는 에러를 만날 때까지 실행되므로, 일반적인 환경에서 이
    'select!'문은 두 셧다운 경로 중 하나가 완료될 때까지 계속된다.

    'select!'문은 다음의 형태로 작성한다.

    ```
    <result of async op> = <async op> => <step to perform with result>
    ```

    모든 '<async op>' 문은 동시에 실행된다. 어느 op가 **처음** 완료되면 이에 연결된
    '<step to perform with result>'가 실행된다.
    */
    tokio::select! {
        res = server.run() => {
            /*
            여기서 에러를 수신하면 TCP 리스너로부터의 커넥션 수락이 여러 번
            실패했다는 의미이며, 서버는 실행을 그만두고 셧다운한다.

            각 커넥션 핸들링에서 만나는 에러는 여기까지 올라오지 않는다.
            */
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            // 외부 인터럽트로부터의 셧다운 시그널을 수신했다.
            info!("shutting down");
        }
        _ = shutdown_request_rx.recv() => {
            // 'terminate' 토큰 혹은 치명적 로그 장애로 셧다운이 요청되었다.
            info!("terminate requested; shutting down");
        }
    }

    /*
    'shutdown_complete' 수신자와 전송기를 추출하여 sender 측을 명시적으로 drop한다.
    이렇게 하지 않으면 아래의 '.await'는 영원히 완료되지 않는다.
    */
    let Listener {
        mut shutdown_complete_rx,
        shutdown_complete_tx,
        notify_shutdown,
        ..
    } = server;

    /*
    정지 플래그를 'true'로 쓰면 '구독 중'에 있는 모든 태스크(커넥션 핸들러와
    리포터)는 셧다운 전파를 수신하고 종료한다. 각 핸들러의 종료로 소켓이 닫히고,
    리포터의 종료로 로그 파일이 닫힌다. 남은 로그 버퍼는 flush하지 않는다.
    구독자가 하나도 없다면 전송은 실패하지만, 그 경우 기다릴 태스크도 없다.
    */
    let _ = notify_shutdown.send(true);
    drop(notify_shutdown);

    // 아래의 'Receiver'를 완료하기 위해 마지막 'Sender'를 drop한다.
    drop(shutdown_complete_tx);

    /*
    모든 유효한 커넥션과 리포터가 처리를 마칠 때까지 기다린다. 리스너가 잡고 있던
    'Sender' 핸들은 위에서 drop되었기 때문에, 태스크들이 잡고 있는 'Sender'만이
    남아있다. 이들이 전부 drop되면 'mpsc' 채널이 닫히고 'recv()'는 'None'을
    반환한다.
    */
    let _ = shutdown_complete_rx.recv().await;

    Ok(())
}

impl Listener {
    /**
     * 서버를 가동한다.
     *
     * 인바운드 커넥션을 수신한다. 수락된 각 커넥션마다 그 커넥션을 핸들링할
     * 태스크를 시작한다.
     *
     * # Errors
     *
     * 커넥션 수락에서 에러가 발생하면 'Err'를 반환한다. 여기에는 시간이 지남에 따라
     * 해결될 수 있는 여러 원인이 있을 수 있다. 예를 들어, OS가 내부적으로 제한하는
     * 가용 소켓 수에 도달하는 경우 수락에 실패할 것이다.
     *
     * 프로세스는 일시적인 에러가 스스로 해결되었음을 감지할 수 없다. 이를 핸들링하는
     * 전략 중 하나는 백오프 전략을 구현하는 것이다. 여기서는 이 방법을 취한다.
     */
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        loop {
            /*
            새 소켓을 수락한다. 'accept' 메서드는 내부적으로 에러 복구를 시도하므로,
            여기서 나오는 에러는 복구 불가능한 에러이다.
            */
            let socket = self.accept().await?;

            /*
            어드미션: 캡에 도달해 있으면 소켓을 읽지도 쓰지도 않고 즉시 닫는다.
            카운터도 건드리지 않는다. 프로토콜 수준에서 거절은 조용하다. 피어는
            다음 쓰기에서 닫힌 커넥션을 관찰한다.

            permit은 "forget"으로 세마포어의 **permit값 증가 없이** drop하고,
            핸들러가 처리를 마칠 때 'Drop'에서 직접 반환한다.
            */
            match self.limit_connections.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    debug!("connection cap reached; closing new connection");
                    drop(socket);
                    continue;
                }
            }

            // 한 커넥션에 대한 핸들러 상태를 생성한다.
            let mut handler = Handler {
                /*
                공유 상태로의 핸들을 가져온다. 내부적으로 'Arc'이므로 clone은 ref
                count만을 증가시킨다.
                */
                db: self.db.clone(),

                /*
                커넥션 상태를 초기화한다. 레코드 프레임 파싱을 위한 읽기/쓰기
                버퍼를 초기화한다.
                */
                connection: Connection::new(socket),

                /*
                커넥션 최대치를 제한하는 세마포어. 핸들러가 커넥션 처리를 마치면
                permit은 세마포어로 반환된다.
                */
                limit_connections: self.limit_connections.clone(),

                // 셧다운 알림을 수신한다.
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),

                // 'terminate' 토큰 수신 시 셧다운을 요청할 채널.
                shutdown_request: self.shutdown_request.clone(),

                // 모든 clone이 drop되면 셧다운 완료 수신자에게 알려진다.
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            /*
            커넥션 처리를 위한 태스크를 가동한다. Tokio 태스크는 비동기 그린
            쓰레드에 가까우며, 동시에 실행된다.
            */
            tokio::spawn(async move {
                // 커넥션을 처리한다. 에러를 만나면 로깅한다.
                if let Err(err) = handler.run().await {
                    error!(cause = ?err, "connection error");
                }
            });
        }
    }

    /**
     * 인바운드 커넥션을 수락한다.
     *
     * 에러는 백오프 & 재시도로 핸들링한다. 지수 백오프 전략을 사용한다. 첫 실패 후
     * 1초를 기다리고, 두 번째 실패에서는 2초 기다린다. 이어지는 실패에 대해서는
     * 대기 시간을 2배씩 늘린다. 64초 대기 후인 시도에서 실패하면 이 함수는 에러를
     * 반환한다.
     */
    async fn accept(&mut self) -> crate::Result<TcpStream> {
        let mut backoff = 1;

        // 수락을 몇 번 시도한다.
        loop {
            /*
            수락 연산을 수행한다. 소켓을 성공적으로 수락하면 이 소켓을 반환한다.
            성공하지 못하면 백오프 한도를 확인한다.
            */
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        // 너무 많이 실패했다. 에러를 반환한다.
                        return Err(err.into());
                    }
                }
            }

            // 백오프 시간에 도달할 때까지 실행을 멈춘다.
            time::sleep(Duration::from_secs(backoff)).await;

            // 백오프 시간을 두 배로 늘린다.
            backoff *= 2;
        }
    }
}

impl Handler {
    /**
     * 단일 커넥션을 핸들링한다.
     *
     * 소켓으로부터 레코드 프레임을 읽어 공유 인덱스에 적용한다. 한 커넥션 안에서
     * 레코드는 프레이밍된 순서 그대로 적용된다. 응답은 쓰지 않는다.
     *
     * 셧다운 시그널을 수신하면 커넥션은 안전 상태에 도달할 때까지 처리를 지속한다.
     * 안전 상태는 커넥션을 종료하는 시점이다.
     */
    #[instrument(skip(self))]
    async fn run(&mut self) -> crate::Result<()> {
        // 셧다운 시그널을 수신하기 전까지 계속해서 새 프레임을 읽는다.
        while !self.shutdown.is_shutdown() {
            let maybe_frame = tokio::select! {
                res = self.connection.read_frame() => res?,
                _ = self.shutdown.recv() => {
                    /*
                    셧다운 시그널을 수신하면 'run'함수를 종료한다.
                    이는 태스크를 종료하는 결과가 된다.
                    */
                    return Ok(());
                }
            };

            /*
            'read_frame()'이 'None'을 반환하면 피어가 소켓을 닫은 것이다.
            더 이상 처리할 내용은 없고, 태스크를 종료할 수 있다.
            */
            let frame = match maybe_frame {
                Some(frame) => frame,
                None => return Ok(()),
            };

            match frame {
                Frame::Record(number) => {
                    debug!(number);

                    /*
                    레코드를 공유 인덱스에 적용한다. 리포트가 진행 중이라면 이
                    호출은 리포트가 끝날 때까지 락에서 대기한다.
                    */
                    self.db.ingest(number).await;
                }
                Frame::Terminate => {
                    info!("terminate token received");

                    /*
                    전체 셧다운을 요청한다. 공유 상태의 해체는 라이프사이클 쪽의
                    몫이다.
                    */
                    self.shutdown_request.request();

                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        /*
        세마포어에 permit 하나를 반환한다.

        이 작업은 커넥션 수가 최대치에 도달하여 새 커넥션을 거절하던 리스너를
        재개한다.

        'Drop' 구현에 두어, 커넥션을 핸들링하는 태스크가 panic하는 상황에서도
        permit 반환을 보장한다.
        */
        self.limit_connections.add_permits(1);
    }
}
