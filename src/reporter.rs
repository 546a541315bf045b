use crate::{Db, Shutdown, ShutdownRequest};

use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error};

/**
 * 주기 리포트 태스크.
 *
 * 고정 주기마다 'Db::flush_report'를 호출하여 요약 라인 출력과 로그 버퍼의 디스크
 * flush를 수행한다. 최초의 0값 리포트는 서버가 커넥션 수락을 시작하기 전에
 * 'report'를 직접 호출하는 것으로 만들어진다.
 */
pub(crate) struct Reporter {
    // 공유 상태의 핸들. 리포트 한 번의 실제 작업은 'Db'에 위임한다.
    db: Db,

    /*
    리포터가 소유하는 로그 파일. 서버 시작 시 truncate된 상태로 열리고, 리포터
    외에는 누구도 이 파일에 쓰지 않는다.
    */
    logfile: File,

    // 리포트 주기.
    period: Duration,

    // 셧다운 알림을 수신한다. 시그널을 받으면 다음 fire의 스케줄을 멈춘다.
    shutdown: Shutdown,

    /*
    로그 flush 실패 시 전체 셧다운을 요청하기 위한 핸들. 디스크 장애는 치명적으로
    취급한다.
    */
    shutdown_request: ShutdownRequest,

    /// 직접 사용하지 않는다. 'Reporter'의 drop으로 셧다운 완료 대기자에게 진행
    /// 중이던 fire까지 끝났음을 알린다.
    _shutdown_complete: mpsc::Sender<()>,
}

impl Reporter {
    pub(crate) fn new(
        db: Db,
        logfile: File,
        period: Duration,
        shutdown: Shutdown,
        shutdown_request: ShutdownRequest,
        shutdown_complete: mpsc::Sender<()>,
    ) -> Reporter {
        Reporter {
            db,
            logfile,
            period,
            shutdown,
            shutdown_request,
            _shutdown_complete: shutdown_complete,
        }
    }

    /// 리포트를 한 번 생성한다.
    pub(crate) async fn report(&mut self) -> crate::Result<()> {
        let summary = self.db.flush_report(&mut self.logfile).await?;
        debug!(%summary, "report generated");

        Ok(())
    }

    /**
     * 주기 타이머를 가동한다.
     *
     * 셧다운 시그널을 받으면 추가 fire의 스케줄만 멈춘다. 진행 중인 fire는 끝까지
     * 수행된다. flush가 주기보다 오래 걸려서 밀린 tick은 건너뛴다.
     */
    pub(crate) async fn run(&mut self) {
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.shutdown.is_shutdown() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.report().await {
                        error!(cause = %err, "failed to flush the record log");
                        self.shutdown_request.request();
                        return;
                    }
                }
                _ = self.shutdown.recv() => {
                    /*
                    셧다운 시그널을 수신했다. 남은 로그 버퍼는 flush하지 않고
                    버린다. 내구성 모델은 주기적 buffered append까지이다.
                    */
                    return;
                }
            }
        }
    }
}
