//! 셧다운 시그널링.
//!
//! 이 서버의 셧다운 트리거는 두 가지이다: 어느 커넥션에서든 수신될 수 있는
//! 'terminate' 토큰(그리고 치명적 로그 장애), 그리고 외부 인터럽트. 전자는
//! 'ShutdownRequest'로 발행되어 라이프사이클 컨트롤러 한 곳에 모이고, 컨트롤러는
//! 'watch' 채널로 모든 태스크(커넥션 핸들러와 리포터)에 정지를 전파한다.
//!
//! 요청과 전파를 분리해 두었기 때문에, 'terminate'를 수신한 워커는 공유 상태를
//! 직접 해체하지 않는다.

use tokio::sync::{mpsc, watch};

/// 전체 셧다운을 요청하는 핸들. 커넥션 핸들러와 리포터에 clone되어 전달된다.
#[derive(Clone)]
pub(crate) struct ShutdownRequest {
    requests: mpsc::Sender<()>,
}

impl ShutdownRequest {
    /// 요청 핸들과, 라이프사이클 컨트롤러가 대기할 수신 측을 생성한다.
    ///
    /// 요청은 합쳐질 뿐 세어지지 않으므로, 버퍼는 한 칸이면 충분하다.
    pub(crate) fn channel() -> (ShutdownRequest, mpsc::Receiver<()>) {
        let (requests, rx) = mpsc::channel(1);

        (ShutdownRequest { requests }, rx)
    }

    /// 전체 셧다운을 요청한다.
    ///
    /// 채널이 가득 찼거나 닫혔다면 셧다운은 이미 요청되었거나 진행 중인 것이므로,
    /// 블로킹 없이 결과를 무시한다. 셧다운이 시작되면 수신 측은 더 이상 폴링되지
    /// 않기 때문에, 여기서 대기하면 완료 대기와 맞물려 교착될 수 있다.
    pub(crate) fn request(&self) {
        let _ = self.requests.try_send(());
    }
}

/// 셧다운 전파를 수신한다.
///
/// 라이프사이클 컨트롤러가 'watch::Sender'에 'true'를 쓰면(혹은 sender를 drop하면)
/// 모든 'Shutdown'이 깨어난다. 현재 상태는 채널이 그대로 들고 있으므로, 수신 여부를
/// 따로 기억할 필요 없이 언제든 조회할 수 있다.
pub(crate) struct Shutdown {
    /// 정지 플래그를 전달하는 채널의 수신 측.
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    /// 주어진 'watch::Receiver'를 기반으로 새로운 'Shutdown'을 생성한다.
    pub(crate) fn new(notify: watch::Receiver<bool>) -> Shutdown {
        Shutdown { notify }
    }

    /// 셧다운이 전파되었다면 'true'를 반환한다.
    pub(crate) fn is_shutdown(&self) -> bool {
        *self.notify.borrow()
    }

    /// 셧다운 전파를 수신한다. 필요한 경우 대기한다.
    pub(crate) async fn recv(&mut self) {
        /*
        플래그가 'true'로 바뀔 때까지 대기한다. sender의 drop('changed()'의
        'Err')도 셧다운으로 간주한다. 컨트롤러가 사라진 뒤에 태스크가 계속 살아
        있어서는 안 된다.
        */
        while !*self.notify.borrow() {
            if self.notify.changed().await.is_err() {
                return;
            }
        }
    }
}
