//! 레코드 수집 서버를 향한 비동기 클라이언트 구현체.

use crate::{Connection, Frame};

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/**
수집 서버와 커넥션을 수립한 클라이언트.

'Client'는 'TcpStream' 하나를 기반으로 기본적인 네트워크 클라이언트 기능(no pooling,
재시도, ...)을 제공한다. 커넥션은 ['connect'](fn@connect) 함수를 통해 수립한다.

이 프로토콜은 단방향이다. 서버는 클라이언트에게 어떤 바이트도 쓰지 않으므로, 요청에
대한 응답은 존재하지 않는다.
*/
pub struct Client {
    /**
    레코드 프로토콜 인코더/디코더를 갖춘 TCP 커넥션.
    인코더/디코더는 버퍼링을 사용하는 'TcpStream'으로 구현되어 있다.
    */
    connection: Connection,
}

/**
'addr'에 위치한 수집 서버와의 연결을 수립한다.

'addr'은 'SocketAddr'으로 비동기적 변환이 가능한 어떠한 타입이든 될 수 있다.
여기에는 'SocketAddr'과 문자열이 포함된다. 'ToSocketAddrs' trait은 'std'가 아닌
Tokio의 버전이다.

# Example

```no_run
use numbers_server::client;

#[tokio::main]
async fn main() {
    let client = match client::connect("localhost:4000").await {
        Ok(client) => client,
        Err(_) => panic!("failed to establish connection"),
    };
# drop(client);
}
```
 */
pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Client> {
    /*
    'addr' 아규먼트는 곧바로 'TcpStream::connect'에 전달된다. 이는 비동기 DNS
    룩업을 수행하고, TCP 커넥션 수립을 시도한다. 이 두 단계 중 하나에서 발생하는
    에러는 호출자에게 전달된다.
    */
    let socket = TcpStream::connect(addr).await?;

    // 연결 상태를 초기화한다. 레코드 프레임 인코딩을 위한 버퍼를 할당한다.
    let connection = Connection::new(socket);

    Ok(Client { connection })
}

impl Client {
    /**
    레코드 하나를 전송한다.

    값은 9자리로 0-패딩되고 LF가 붙어 정확히 한 프레임으로 나간다. 서버가 캡 초과로
    커넥션을 이미 닫았거나 셧다운 중이라면 쓰기는 'Err'로 실패한다.
    */
    pub async fn send(&mut self, record: u32) -> crate::Result<()> {
        let frame = Frame::Record(record);

        debug!(request = ?frame);

        self.connection.write_frame(&frame).await
    }

    /**
    'terminate' 토큰을 전송하고, 서버가 커넥션을 닫을 때까지 기다린다.

    서버는 클라이언트에게 어떤 바이트도 쓰지 않으므로, 읽기의 종료는 곧 서버가
    셧다운 과정에서 소켓을 닫았음을 의미한다. 원격 close와 reset 모두 셧다운의
    완료로 간주한다.
    */
    pub async fn terminate(&mut self) -> crate::Result<()> {
        self.connection.write_frame(&Frame::Terminate).await?;

        loop {
            match self.connection.read_frame().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Ok(()),
            }
        }
    }
}
