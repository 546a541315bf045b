//! 서버 통합 테스트.
//!
//! 실제 리스너를 임시 포트에 바인딩하고, raw 'TcpStream'으로 와이어 프로토콜을
//! 직접 구동한다. 리포트 주기가 필요한 테스트는 짧은 주기로 서버를 가동한 뒤 로그
//! 파일의 내용을 관찰한다.

use numbers_server::server::{self, Config};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/*
테스트 서버 하나를 임시 포트에 가동한다. 로그 파일은 임시 디렉토리에 두고, 디렉토리
핸들을 함께 반환하여 테스트가 끝날 때까지 유지되도록 한다.
*/
async fn start_server(
    mut config: Config,
) -> (
    SocketAddr,
    PathBuf,
    TempDir,
    JoinHandle<numbers_server::Result<()>>,
) {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("numbers.log");
    config.log_filename = log_path.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(server::run(listener, config, std::future::pending::<()>()));

    (addr, log_path, dir, handle)
}

/// 짧은 리포트 주기의 구성.
fn fast_report() -> Config {
    Config {
        report_period: Duration::from_millis(100),
        ..Config::default()
    }
}

/// 커넥션이 아직 열려있음을 확인한다. 서버는 클라이언트에게 어떤 바이트도 쓰지
/// 않으므로, 읽기는 서버가 소켓을 닫기 전까지 완료되지 않아야 한다.
async fn assert_still_open(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(read.is_err(), "expected the connection to stay open");
}

/// 서버가 커넥션을 닫았음을 확인한다. FIN 수신 시 읽기는 0을 반환한다.
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("expected the server to close the connection")
        .unwrap();
    assert_eq!(n, 0, "expected no bytes from the server");
}

#[tokio::test]
async fn valid_records_keep_the_connection_open() {
    let (addr, _log, _dir, _handle) = start_server(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    for record in &[
        "000000001\n",
        "123456789\n",
        "037209858\n",
        "111111111\n",
        "999999999\n",
    ] {
        stream.write_all(record.as_bytes()).await.unwrap();
    }

    assert_still_open(&mut stream).await;
}

#[tokio::test]
async fn an_invalid_record_closes_the_connection() {
    let (addr, _log, _dir, handle) = start_server(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"1234b6789\n").await.unwrap();

    assert_closed(&mut stream).await;

    // 한 커넥션의 에러는 다른 커넥션(그리고 서버 자체)에 영향을 주지 않는다.
    assert!(!handle.is_finished());
    let mut other = TcpStream::connect(addr).await.unwrap();
    other.write_all(b"000000001\n").await.unwrap();
    assert_still_open(&mut other).await;
}

#[tokio::test]
async fn an_lf_in_a_digit_position_closes_the_connection() {
    let (addr, _log, _dir, _handle) = start_server(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // LF가 위치 8에 있다. 위치 9의 바이트와 무관하게 유효한 프레임이 아니다.
    stream.write_all(b"12345678\n9").await.unwrap();

    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn a_terminate_token_with_a_wrong_terminator_is_a_framing_error() {
    let (addr, _log, _dir, handle) = start_server(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"terminate!").await.unwrap();

    assert_closed(&mut stream).await;

    // 서버는 계속 가동 중이어야 한다.
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn connections_over_the_cap_are_closed_immediately() {
    let config = Config {
        max_connections: 2,
        ..Config::default()
    };
    let (addr, _log, _dir, _handle) = start_server(config).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    // 두 커넥션이 수락되어 등록될 시간을 준다.
    sleep(Duration::from_millis(100)).await;

    // 캡을 넘는 커넥션은 수락 직후 바이트 없이 닫힌다.
    let mut extra = TcpStream::connect(addr).await.unwrap();
    assert_closed(&mut extra).await;

    // 기존 커넥션은 계속 사용 가능하다.
    first.write_all(b"000000001\n").await.unwrap();
    second.write_all(b"000000002\n").await.unwrap();
    assert_still_open(&mut first).await;
    assert_still_open(&mut second).await;

    // 커넥션 하나가 닫히면 자리가 돌아온다.
    drop(first);
    sleep(Duration::from_millis(200)).await;

    let mut third = TcpStream::connect(addr).await.unwrap();
    third.write_all(b"000000003\n").await.unwrap();
    assert_still_open(&mut third).await;
}

#[tokio::test]
async fn terminate_shuts_the_server_down() {
    let (addr, _log, _dir, handle) = start_server(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"terminate\n").await.unwrap();

    let res = timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not shut down")
        .unwrap();
    assert!(res.is_ok());

    // 리스너가 내려갔으므로 새 커넥션은 수립되지 않는다.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn first_occurrences_are_flushed_to_the_log() {
    let (addr, log_path, _dir, _handle) = start_server(fast_report()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"000000001\n000000001\n000000002\n")
        .await
        .unwrap();

    sleep(Duration::from_millis(500)).await;

    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines, vec!["000000001", "000000002"]);
}

#[tokio::test]
async fn a_frame_split_across_writes_is_reassembled() {
    let (addr, log_path, _dir, _handle) = start_server(fast_report()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // 부분 프레임은 carry로 유지되어야 한다.
    stream.write_all(b"00000").await.unwrap();
    sleep(Duration::from_millis(150)).await;
    stream.write_all(b"0042\n").await.unwrap();

    sleep(Duration::from_millis(500)).await;

    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines, vec!["000000042"]);

    assert_still_open(&mut stream).await;
}

#[tokio::test]
async fn boundary_records_are_valid() {
    let (addr, log_path, _dir, _handle) = start_server(fast_report()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"000000000\n999999999\n").await.unwrap();

    sleep(Duration::from_millis(500)).await;

    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines, vec!["000000000", "999999999"]);

    assert_still_open(&mut stream).await;
}

#[tokio::test]
async fn duplicate_accounting_spans_connections() {
    let (addr, log_path, _dir, _handle) = start_server(fast_report()).await;

    // 두 동시 클라이언트가 같은 레코드를 한 번씩 전송한다.
    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"000000005\n").await.unwrap();
    second.write_all(b"000000005\n").await.unwrap();

    sleep(Duration::from_millis(500)).await;

    // 로그에는 최초 수신 하나만 남는다.
    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines, vec!["000000005"]);
}

#[tokio::test]
async fn a_partial_frame_at_close_leaves_no_log_entry() {
    let (addr, log_path, _dir, _handle) = start_server(fast_report()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // LF가 위치 8에 있는 9바이트 시퀀스. 완전한 프레임을 이루지 못한 채 닫는다.
    stream.write_all(b"12345678\n").await.unwrap();
    drop(stream);

    sleep(Duration::from_millis(500)).await;

    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    assert_eq!(contents, "");
}
