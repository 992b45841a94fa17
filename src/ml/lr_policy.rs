//! 検証精度の停滞に応じて学習率を下げるポリシー

use tracing::info;

use crate::error::TrainingError;
use crate::model::config::PlateauSettings;

/// 停滞検知の状態機械
///
/// 各エポック完了後に1回だけ [`PlateauPolicy::observe`] を呼びます。
#[derive(Debug, Clone)]
pub struct PlateauPolicy {
    settings: PlateauSettings,
    current_lr: f64,
    best: Option<f64>,
    stalled: usize,
    last_epoch: Option<usize>,
}

impl PlateauPolicy {
    pub fn new(initial_lr: f64, settings: PlateauSettings) -> Self {
        Self {
            settings,
            current_lr: initial_lr,
            best: None,
            stalled: 0,
            last_epoch: None,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// 完了したエポックの検証精度を記録し、次エポックの学習率を返す
    ///
    /// エポック番号は直前より1つ大きくなければなりません。
    pub fn observe(&mut self, epoch: usize, val_accuracy: f64) -> Result<f64, TrainingError> {
        let expected = self.last_epoch.map(|e| e + 1);
        if let Some(expected) = expected {
            if epoch != expected {
                return Err(TrainingError::EpochOutOfOrder {
                    last: expected - 1,
                    got: epoch,
                });
            }
        }
        self.last_epoch = Some(epoch);

        let improved = match self.best {
            None => true,
            Some(best) => val_accuracy > best + self.settings.min_delta,
        };

        if improved {
            self.best = Some(val_accuracy);
            self.stalled = 0;
            return Ok(self.current_lr);
        }

        self.stalled += 1;
        if self.stalled >= self.settings.patience {
            let reduced = (self.current_lr * self.settings.factor).max(self.settings.min_lr);
            if reduced < self.current_lr {
                info!(
                    "エポック {}: 検証精度が停滞したため学習率を {:.2e} -> {:.2e} に下げます",
                    epoch, self.current_lr, reduced
                );
            }
            self.current_lr = reduced;
            self.stalled = 0;
        }
        Ok(self.current_lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PlateauPolicy {
        PlateauPolicy::new(1e-3, PlateauSettings::default())
    }

    #[test]
    fn test_halves_after_two_stalled_epochs() {
        let mut p = policy();
        assert_eq!(p.observe(1, 0.50).unwrap(), 1e-3);
        assert_eq!(p.observe(2, 0.50).unwrap(), 1e-3);
        assert_eq!(p.observe(3, 0.49).unwrap(), 5e-4);
        // カウンタはリセットされる
        assert_eq!(p.observe(4, 0.50).unwrap(), 5e-4);
        assert_eq!(p.observe(5, 0.50).unwrap(), 2.5e-4);
    }

    #[test]
    fn test_gain_below_min_delta_is_not_an_improvement() {
        let mut p = policy();
        p.observe(1, 0.5).unwrap();
        p.observe(2, 0.50005).unwrap();
        assert_eq!(p.observe(3, 0.50009).unwrap(), 5e-4);
        assert_eq!(p.best(), Some(0.5));
    }

    #[test]
    fn test_improvement_resets_stall_counter() {
        let mut p = policy();
        p.observe(1, 0.5).unwrap();
        p.observe(2, 0.4).unwrap();
        p.observe(3, 0.6).unwrap();
        assert_eq!(p.observe(4, 0.6).unwrap(), 1e-3);
        assert_eq!(p.observe(5, 0.6).unwrap(), 5e-4);
    }

    #[test]
    fn test_rate_is_floored_at_min_lr() {
        let mut p = PlateauPolicy::new(1.5e-5, PlateauSettings::default());
        p.observe(1, 0.1).unwrap();
        p.observe(2, 0.1).unwrap();
        assert_eq!(p.observe(3, 0.1).unwrap(), 1e-5);
        p.observe(4, 0.1).unwrap();
        assert_eq!(p.observe(5, 0.1).unwrap(), 1e-5);
    }

    #[test]
    fn test_out_of_order_epoch_is_rejected() {
        let mut p = policy();
        p.observe(1, 0.1).unwrap();
        let err = p.observe(3, 0.2).unwrap_err();
        assert!(matches!(err, TrainingError::EpochOutOfOrder { last: 1, got: 3 }));
        assert!(matches!(
            p.observe(1, 0.2),
            Err(TrainingError::EpochOutOfOrder { last: 1, got: 1 })
        ));
    }
}
