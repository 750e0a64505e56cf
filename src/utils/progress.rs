use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// 速度计算器，基于滑动时间窗口
#[derive(Debug)]
pub struct SpeedCalculator {
    /// 历史记录 (时间, 累计字节数)
    history: VecDeque<(Instant, u64)>,
    /// 历史窗口大小
    window_size: Duration,
    /// 最大历史记录数
    max_entries: usize,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration) -> Self {
        Self {
            history: VecDeque::new(),
            window_size,
            max_entries: 100,
        }
    }

    /// 添加数据点
    pub fn add_data_point(&mut self, total_bytes: u64) {
        let now = Instant::now();
        self.history.push_back((now, total_bytes));

        // 移除过期的数据点，至少保留两个
        while self.history.len() > 2 {
            match self.history.front() {
                Some(&(time, _)) if now.duration_since(time) > self.window_size => {
                    self.history.pop_front();
                }
                _ => break,
            }
        }

        while self.history.len() > self.max_entries {
            self.history.pop_front();
        }
    }

    /// 计算当前速度（字节/秒）
    pub fn calculate_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };

        let duration = last.0.duration_since(first.0).as_secs_f64();
        let bytes = last.1.saturating_sub(first.1);

        if duration > 0.0 {
            bytes as f64 / duration
        } else {
            0.0
        }
    }

    /// 估算剩余时间
    pub fn estimate_eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.calculate_speed();

        if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
        } else {
            None
        }
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size = bytes as f64;
    if size < KB {
        format!("{} B", bytes)
    } else if size < MB {
        format!("{:.1} KB", size / KB)
    } else if size < GB {
        format!("{:.1} MB", size / MB)
    } else {
        format!("{:.2} GB", size / GB)
    }
}

/// 格式化速度
pub fn format_speed(bytes_per_second: f64) -> String {
    const MB: f64 = 1024.0 * 1024.0;

    if bytes_per_second < MB {
        format!("{:.0} KB/s", bytes_per_second / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_second / MB)
    }
}

/// 格式化剩余时间
pub fn format_eta(eta: Duration) -> String {
    let seconds = eta.as_secs_f64();

    if seconds < 60.0 {
        format!("{}s", seconds.ceil() as u64)
    } else if seconds < 3600.0 {
        format!("{}m {}s", (seconds / 60.0).floor() as u64, (seconds % 60.0).ceil() as u64)
    } else {
        format!(
            "{}h {}m",
            (seconds / 3600.0).floor() as u64,
            ((seconds % 3600.0) / 60.0).floor() as u64
        )
    }
}
