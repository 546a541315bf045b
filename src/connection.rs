use crate::frame::{self, Frame};

use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/**
 * 원격 피어와 'Frame' 값을 주고받는다.
 *
 * 'Connection'의 목적은 'TcpStream' 위에서 프레임들을 읽고 쓰는 데에 있다. 이
 * 프로토콜의 프레임은 전부 10바이트 고정 길이이므로, 프레이밍은 스캐닝이 필요 없는
 * stride 단위의 걷기가 된다.
 *
 * 프레임을 읽을 때는 내부의 읽기 버퍼를 사용한다. TCP로 전송되는 데이터는 크기가
 * 일정하지 않은 청크로 쪼개져 도착하므로, 마지막 프레임은 불완전한 상태로 수신될 수
 * 있다. 아직 완전한 프레임을 이루지 못한 바이트는 버퍼의 꼬리에 남아(carry) 다음
 * 읽기에서 이어 붙는다.
 *
 * 프레임 쓰기는 클라이언트 측에서만 일어난다. 서버는 피어에게 어떤 바이트도 쓰지
 * 않는다.
 */
pub struct Connection {
    // 버퍼링된 'TcpStream' 래퍼.
    stream: BufWriter<TcpStream>,

    /*
    읽기 버퍼. 레코드가 대량으로 연속 수신되는 스트림을 가정하므로, 큰 버퍼 하나로
    읽어서 내부 할당과 read 시스템콜 횟수를 줄인다.
    */
    buffer: BytesMut,
}

impl Connection {
    /// 'socket'을 기반으로 새로운 'Connection'을 생성한다. 읽기/쓰기 버퍼를
    /// 초기화한다.
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(64 * 1024),
        }
    }

    /**
     * 스트림으로부터 프레임 하나를 읽는다.
     *
     * 완전한 프레임을 이루기에 충분한 바이트가 모일 때까지 대기한다. 프레임 파싱
     * 이후 버퍼에 남은 바이트는 다음 'read_frame' 호출을 위해 유지된다.
     *
     * # Returns
     *
     * 성공 시 수신한 프레임을 반환한다. 피어가 커넥션을 닫았다면 'None'을 반환한다.
     * 이때 프레임을 이루지 못한 잔여 바이트는 버린다. 유효하지 않은 프레임을 만나면
     * 'Err'을 반환하며, 이는 해당 커넥션에 대해 치명적이다.
     */
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            /*
            버퍼에 쌓인 바이트에서 프레임 하나의 파싱을 시도한다. 충분한 바이트가
            모였다면 프레임을 반환한다.
            */
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            /*
            버퍼의 바이트가 부족하다. 소켓에서 더 읽어들인다.

            '0'을 반환하면 피어가 커넥션을 닫은 것이다.
            */
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Ok(None);
            }
        }
    }

    /// 버퍼에서 프레임 하나의 파싱을 시도한다. 완전한 프레임을 이루기에 바이트가
    /// 부족하면 'Ok(None)'을 반환한다.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::parse(&mut buf) {
            Ok(frame) => {
                // 소비한 프레임만큼 버퍼를 전진시킨다. 나머지는 carry로 남는다.
                let len = buf.position() as usize;
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            /*
            버퍼의 바이트 수가 프레임 하나에 미치지 못한다. 호출자가 소켓에서 더
            읽어야 한다.
            */
            Err(Incomplete) => Ok(None),

            // 유효하지 않은 프레임. 커넥션을 종료해야 한다.
            Err(e) => Err(e.into()),
        }
    }

    /// 프레임 하나를 인코딩하여 피어에게 쓴다.
    pub async fn write_frame(&mut self, frame: &Frame) -> crate::Result<()> {
        match frame {
            Frame::Record(record) => {
                if *record > frame::MAX_RECORD {
                    return Err("record out of range".into());
                }

                // 9자리 0-패딩과 LF로 정확히 한 프레임을 이룬다.
                let line = format!("{:09}\n", record);
                self.stream.write_all(line.as_bytes()).await?;
            }
            Frame::Terminate => {
                self.stream.write_all(frame::TERMINATE).await?;
            }
        }

        self.stream.flush().await?;

        Ok(())
    }
}
