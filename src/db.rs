use crate::frame;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/*
모든 커넥션이 공유하는 서버 상태.

'Db'는 지금까지 수신한 레코드 값의 인덱스와, 현재 리포트 주기의 카운터, 그리고 아직
디스크에 쓰이지 않은 유니크 레코드의 로그 버퍼를 가진다.

한 'Db' 인스턴스는 공유 상태에 대한 핸들이다. 'Db'의 cloning은 shallow이며, atomic
레퍼런스 카운트를 증가시키기만 한다.
 */
#[derive(Clone)]
pub(crate) struct Db {
    // 공유 상태의 핸들.
    shared: Arc<Shared>,
}

struct Shared {
    /*
    공유 상태는 Tokio의 'Mutex'로 보호된다. std의 mutex가 아니다.

    레코드 적용의 크리티컬 섹션 자체는 짧고 CPU 바운드이다(인덱스 룩업 하나와 상수
    시간의 카운터 갱신). 하지만 리포터는 요약 라인 출력, 카운터 리셋, 디스크 flush가
    끝날 때까지 락을 쥔 채 '.await'를 거친다. 락을 '.await' 너머로 유지해야 할 때가
    Tokio mutex를 쓰는 경우이다.

    리포트가 진행되는 동안 모든 레코드 적용은 이 락에서 대기하므로, 이 락이 곧
    "리포트 진행 중" 게이트의 역할을 겸한다. Tokio mutex는 FIFO이기 때문에 어떤
    레코드 적용도 리포트에 걸쳐서 일어나지 않는다.
    */
    state: Mutex<State>,
}

struct State {
    /*
    수신한 레코드 값의 인덱스. 값(bool)은 "두 번 이상 수신됨" 플래그이다.

    키는 성공적으로 수집된 적이 있을 때에만 존재하고, 한 번 들어오면 제거되지
    않는다. 플래그는 정확히 한 번 수신된 동안 false이며, 한 번 true가 되면
    되돌아가지 않는다.
    */
    numbers: BTreeMap<u32, bool>,

    // 현재 주기의 카운터. 'new_unique'와 'duplicates'는 리포트마다 리셋된다.
    report: Report,

    /*
    마지막 flush 이후 처음 수신된 레코드들의 9자리 텍스트 형태.

    디스크에는 리포트 생성 시점에만 쓴다. 작은 쓰기를 대량으로 반복하는 것은 매우
    비효율적이므로, 버퍼 하나에 모았다가 한 번에 쓴다. 버퍼는 오직 리포터만
    비운다.
    */
    log_buffer: Vec<String>,
}

/// 한 리포트 주기의 요약.
///
/// 'Display' 구현이 리포트 라인의 출력 형식을 정의한다.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Report {
    /// 이번 주기에 처음 수신된 레코드 수.
    pub(crate) new_unique: u64,

    /// 이번 주기에 수신된 중복 레코드 수.
    pub(crate) duplicates: u64,

    /// 서버 가동 이후 정확히 한 번 수신된 레코드의 총 수. 값이 두 번째로 수신되는
    /// 순간 감소한다.
    pub(crate) unique_total: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Received {} unique numbers, {} duplicates. Unique total: {}",
            self.new_unique, self.duplicates, self.unique_total
        )
    }
}

impl Db {
    /// 비어있는 새로운 'Db' 인스턴스를 생성한다.
    pub(crate) fn new() -> Db {
        Db {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    numbers: BTreeMap::new(),
                    report: Report::default(),
                    log_buffer: Vec::new(),
                }),
            }),
        }
    }

    /**
     * 레코드 하나를 인덱스에 적용한다.
     *
     * 락 안에서 정확히 다음 세 전이 중 하나가 일어난다:
     *
     * - 처음 보는 값: 플래그 false로 삽입, 'new_unique'와 'unique_total' 증가,
     *   9자리 텍스트를 로그 버퍼에 추가.
     * - 한 번만 수신됐던 값: 플래그를 true로 세우고 'unique_total' 감소,
     *   'duplicates' 증가.
     * - 이미 중복됐던 값: 'duplicates'만 증가.
     *
     * 레코드는 락 안에서 전부 적용되거나 전혀 적용되지 않는다.
     */
    pub(crate) async fn ingest(&self, number: u32) {
        use std::collections::btree_map::Entry;

        let mut state = self.shared.state.lock().await;

        // 가드 너머의 개별 필드를 동시에 빌리기 위해 역참조한다.
        let state = &mut *state;

        match state.numbers.entry(number) {
            Entry::Vacant(entry) => {
                entry.insert(false);
                state.report.new_unique += 1;
                state.report.unique_total += 1;
                state.log_buffer.push(format!("{:09}", number));
            }
            Entry::Occupied(mut entry) => {
                if !*entry.get() {
                    entry.insert(true);
                    state.report.unique_total -= 1;
                }
                state.report.duplicates += 1;
            }
        }
    }

    /**
     * 리포트를 생성한다: 요약 라인을 stdout에 출력하고, 주기 카운터를 리셋하고,
     * 로그 버퍼를 로그 파일에 flush한다.
     *
     * 이 전 과정은 상태 락을 쥔 채로 이루어진다. 따라서 출력된 요약의 세 숫자와
     * 새로 디스크에 적힌 레코드는 같은 순간을 기술하며, 어떤 레코드도 리포트에
     * 걸쳐서 적용되지 않는다. flush가 느리면 그만큼 레코드 적용이 락에서 대기하고,
     * 짧은 지연은 각 소켓의 읽기 버퍼가 흡수한다.
     */
    pub(crate) async fn flush_report(&self, logfile: &mut File) -> crate::Result<Report> {
        let mut state = self.shared.state.lock().await;

        let summary = state.report;

        // stdout은 라인 버퍼링이므로 LF가 곧 flush이다.
        println!("{}", summary);

        state.report.new_unique = 0;
        state.report.duplicates = 0;

        let entries = std::mem::take(&mut state.log_buffer);
        if !entries.is_empty() {
            // 레코드마다 LF를 붙여, 연속된 flush 사이에서도 파일이 줄 단위로
            // 파싱 가능하도록 유지한다.
            let mut chunk = String::with_capacity(entries.len() * frame::FRAME_LEN);
            for entry in &entries {
                chunk.push_str(entry);
                chunk.push('\n');
            }

            logfile.write_all(chunk.as_bytes()).await?;
            logfile.flush().await?;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn logfile(dir: &tempfile::TempDir) -> File {
        File::create(dir.path().join("numbers.log")).await.unwrap()
    }

    #[tokio::test]
    async fn a_first_sighting_counts_as_unique() {
        let db = Db::new();
        db.ingest(5).await;

        let state = db.shared.state.lock().await;
        assert_eq!(
            state.report,
            Report {
                new_unique: 1,
                duplicates: 0,
                unique_total: 1
            }
        );
        assert_eq!(state.numbers.get(&5), Some(&false));
        assert_eq!(state.log_buffer, vec!["000000005".to_string()]);
    }

    #[tokio::test]
    async fn a_second_sighting_flips_the_duplicate_flag() {
        let db = Db::new();
        db.ingest(5).await;
        db.ingest(5).await;

        let state = db.shared.state.lock().await;
        assert_eq!(
            state.report,
            Report {
                new_unique: 1,
                duplicates: 1,
                unique_total: 0
            }
        );
        assert_eq!(state.numbers.get(&5), Some(&true));
        // 로그 버퍼에는 최초 수신만 남는다.
        assert_eq!(state.log_buffer.len(), 1);
    }

    #[tokio::test]
    async fn further_sightings_only_count_duplicates() {
        let db = Db::new();
        for _ in 0..4 {
            db.ingest(7).await;
        }

        let state = db.shared.state.lock().await;
        assert_eq!(
            state.report,
            Report {
                new_unique: 1,
                duplicates: 3,
                unique_total: 0
            }
        );
        assert_eq!(state.numbers.get(&7), Some(&true));
    }

    #[tokio::test]
    async fn unique_total_matches_the_unflagged_keys() {
        let db = Db::new();
        for number in &[1, 2, 2, 3, 3, 3, 4, 999_999_999] {
            db.ingest(*number).await;
        }

        let state = db.shared.state.lock().await;
        let unflagged = state.numbers.values().filter(|seen_twice| !**seen_twice).count();
        assert_eq!(state.report.unique_total, unflagged as u64);
        assert_eq!(state.report.unique_total, 3);
    }

    #[tokio::test]
    async fn the_initial_report_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = logfile(&dir).await;

        let db = Db::new();
        let summary = db.flush_report(&mut file).await.unwrap();

        assert_eq!(summary, Report::default());

        let contents = tokio::fs::read_to_string(dir.path().join("numbers.log"))
            .await
            .unwrap();
        assert_eq!(contents, "");
    }

    #[tokio::test]
    async fn a_flush_resets_period_counters_and_drains_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = logfile(&dir).await;

        let db = Db::new();
        db.ingest(1).await;
        db.ingest(1).await;
        db.ingest(2).await;

        let summary = db.flush_report(&mut file).await.unwrap();
        assert_eq!(
            summary,
            Report {
                new_unique: 2,
                duplicates: 1,
                unique_total: 2
            }
        );

        // 누적 유니크 수는 리셋되지 않는다.
        let summary = db.flush_report(&mut file).await.unwrap();
        assert_eq!(
            summary,
            Report {
                new_unique: 0,
                duplicates: 0,
                unique_total: 2
            }
        );

        let contents = tokio::fs::read_to_string(dir.path().join("numbers.log"))
            .await
            .unwrap();
        assert_eq!(contents, "000000001\n000000002\n");
    }

    #[tokio::test]
    async fn flushes_concatenate_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = logfile(&dir).await;

        let db = Db::new();
        db.ingest(3).await;
        db.flush_report(&mut file).await.unwrap();
        db.ingest(4).await;
        db.flush_report(&mut file).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("numbers.log"))
            .await
            .unwrap();
        assert_eq!(contents, "000000003\n000000004\n");
    }

    #[test]
    fn the_report_line_format() {
        let report = Report {
            new_unique: 2,
            duplicates: 1,
            unique_total: 2
        };
        assert_eq!(
            report.to_string(),
            "Received 2 unique numbers, 1 duplicates. Unique total: 2"
        );
    }
}
