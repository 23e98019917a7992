use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{RiskMonitorConfig, RiskType, VenueKind};
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{DomainEvent, ExposureSnapshot, RiskAssessment, RiskBreach, RiskLevel};
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::{InstrumentKey, PositionType};
use crate::util::UtilityManager;

/// Evaluates the configured risk set and accumulates warnings/breaches.
///
/// Every evaluator reduces to a utilization ratio where 1.0 means "at the
/// limit"; the shared warning/critical thresholds then grade each ratio, so
/// limits of different shapes (floors like health factor, caps like LTV)
/// degrade consistently.
pub struct RiskMonitor {
    config: RiskMonitorConfig,
    venue_kinds: BTreeMap<String, VenueKind>,
    util: UtilityManager,
    latest: Option<RiskAssessment>,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

struct BookAggregates {
    collateral: f64,
    debt: f64,
    cex_collateral: f64,
    perp_notional: f64,
}

impl RiskMonitor {
    pub fn new(
        config: &RiskMonitorConfig,
        venue_kinds: BTreeMap<String, VenueKind>,
        util: UtilityManager,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Result<Self, EngineError> {
        // Fail fast: an enabled risk type without its limit is a
        // construction error, not a runtime surprise.
        for risk_type in &config.enabled_risk_types {
            let missing = match risk_type {
                RiskType::HealthFactor => {
                    config.risk_limits.min_health_factor.is_none()
                        || config.risk_limits.liquidation_threshold.is_none()
                }
                RiskType::Ltv => config.risk_limits.max_ltv.is_none(),
                RiskType::CexMargin => config.risk_limits.max_margin_usage.is_none(),
                RiskType::FundingRate => config.risk_limits.max_funding_rate.is_none(),
                RiskType::DeltaTolerance => false,
            };
            if missing {
                return Err(EngineError::MissingConfig {
                    field: format!(
                        "component_config.risk_monitor.risk_limits for {}",
                        risk_type.as_str()
                    ),
                });
            }
        }
        Ok(Self {
            config: config.clone(),
            venue_kinds,
            util,
            latest: None,
            logger,
            events,
        })
    }

    fn aggregates(
        &self,
        positions: &HashMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
        warnings: &mut Vec<String>,
    ) -> BookAggregates {
        let mut agg = BookAggregates {
            collateral: 0.0,
            debt: 0.0,
            cex_collateral: 0.0,
            perp_notional: 0.0,
        };
        for (key, amount) in positions {
            if *amount == 0.0 {
                continue;
            }
            let value = match self.util.position_value(snapshot, key, *amount) {
                Ok(v) => v,
                Err(e) => {
                    let err = EngineError::MissingRiskInput {
                        risk_type: "book_aggregates".to_string(),
                        detail: e.to_string(),
                    };
                    self.logger.engine_error(&err);
                    warnings.push(err.to_string());
                    continue;
                }
            };
            let is_cex = self
                .venue_kinds
                .get(key.venue())
                .is_some_and(|kind| *kind == VenueKind::Cex);
            match key.position_type() {
                PositionType::AToken | PositionType::Lst => agg.collateral += value,
                PositionType::DebtToken => agg.debt += -value,
                PositionType::Perp => agg.perp_notional += value.abs(),
                PositionType::BaseToken if is_cex && value > 0.0 => agg.cex_collateral += value,
                PositionType::BaseToken => {}
            }
        }
        agg
    }

    pub fn assess(
        &mut self,
        timestamp: u64,
        positions: &HashMap<InstrumentKey, f64>,
        exposure: &ExposureSnapshot,
        snapshot: &MarketSnapshot,
    ) -> Result<RiskAssessment, EngineError> {
        let mut warnings: Vec<String> = Vec::new();
        let mut breaches: Vec<RiskBreach> = Vec::new();
        let agg = self.aggregates(positions, snapshot, &mut warnings);

        let mut health_factor = None;
        let mut ltv = None;
        let mut margin_usage = None;
        let mut level = RiskLevel::Healthy;

        let mut grade = |risk_type: RiskType, ratio: f64, message: String| {
            let breach_level = if ratio >= self.config.critical_threshold {
                RiskLevel::Critical
            } else if ratio >= self.config.warning_threshold {
                RiskLevel::Warning
            } else {
                return;
            };
            let code = if breach_level == RiskLevel::Critical {
                "RISK-002"
            } else {
                "RISK-001"
            };
            breaches.push(RiskBreach {
                risk_type: risk_type.as_str().to_string(),
                code: code.to_string(),
                message,
                level: breach_level,
            });
            if breach_level > level {
                level = breach_level;
            }
        };

        for risk_type in &self.config.enabled_risk_types {
            match risk_type {
                RiskType::HealthFactor => {
                    if agg.debt <= 0.0 {
                        continue;
                    }
                    let liq = self
                        .config
                        .risk_limits
                        .liquidation_threshold
                        .expect("validated at construction");
                    let min_hf = self
                        .config
                        .risk_limits
                        .min_health_factor
                        .expect("validated at construction");
                    let hf = agg.collateral * liq / agg.debt;
                    health_factor = Some(hf);
                    let ratio = if hf > 0.0 { min_hf / hf } else { f64::INFINITY };
                    grade(
                        RiskType::HealthFactor,
                        ratio,
                        format!("health factor {hf:.3} vs minimum {min_hf:.3}"),
                    );
                }
                RiskType::Ltv => {
                    if agg.collateral <= 0.0 {
                        continue;
                    }
                    let max_ltv = self
                        .config
                        .risk_limits
                        .max_ltv
                        .expect("validated at construction");
                    let current = agg.debt / agg.collateral;
                    ltv = Some(current);
                    grade(
                        RiskType::Ltv,
                        current / max_ltv,
                        format!("ltv {current:.3} vs cap {max_ltv:.3}"),
                    );
                }
                RiskType::CexMargin => {
                    if agg.perp_notional <= 0.0 {
                        continue;
                    }
                    let max_usage = self
                        .config
                        .risk_limits
                        .max_margin_usage
                        .expect("validated at construction");
                    let usage = if agg.cex_collateral > 0.0 {
                        agg.perp_notional / agg.cex_collateral
                    } else {
                        f64::INFINITY
                    };
                    margin_usage = Some(usage);
                    grade(
                        RiskType::CexMargin,
                        usage / max_usage,
                        format!("margin usage {usage:.3} vs cap {max_usage:.3}"),
                    );
                }
                RiskType::FundingRate => {
                    let max_rate = self
                        .config
                        .risk_limits
                        .max_funding_rate
                        .expect("validated at construction");
                    for (key, amount) in positions {
                        if key.position_type() != PositionType::Perp || *amount == 0.0 {
                            continue;
                        }
                        match snapshot.funding_rate(key.symbol()) {
                            Ok(rate) => grade(
                                RiskType::FundingRate,
                                rate.abs() / max_rate,
                                format!("funding rate {rate:.6} on {key} vs cap {max_rate:.6}"),
                            ),
                            Err(e) => {
                                let err = EngineError::MissingRiskInput {
                                    risk_type: RiskType::FundingRate.as_str().to_string(),
                                    detail: e.to_string(),
                                };
                                self.logger.engine_error(&err);
                                warnings.push(err.to_string());
                            }
                        }
                    }
                }
                RiskType::DeltaTolerance => {
                    if exposure.total_value.abs() <= 0.0 {
                        continue;
                    }
                    // Directional exposure of the tracked asset, as a
                    // fraction of book value.
                    let tracked = exposure
                        .exposures
                        .get(&self.config.delta_tracking_asset)
                        .map(|e| e.value)
                        .unwrap_or(0.0);
                    let drift = tracked.abs() / exposure.total_value.abs();
                    grade(
                        RiskType::DeltaTolerance,
                        drift / self.config.delta_tolerance,
                        format!(
                            "delta drift {drift:.5} on {} vs tolerance {:.5}",
                            self.config.delta_tracking_asset, self.config.delta_tolerance
                        ),
                    );
                }
            }
        }

        for breach in &breaches {
            self.logger.log(
                if breach.level == RiskLevel::Critical {
                    crate::error::Severity::High
                } else {
                    crate::error::Severity::Medium
                },
                &breach.message,
                Some(&breach.code),
                None,
            );
        }

        let result = RiskAssessment {
            timestamp,
            health_factor,
            ltv,
            liquidation_threshold: self.config.risk_limits.liquidation_threshold,
            margin_usage,
            risk_level: level,
            warnings,
            breaches,
        };
        self.events.emit(DomainEvent::Risk(result.clone()));
        self.latest = Some(result.clone());
        Ok(result)
    }

    pub fn latest(&self) -> Option<&RiskAssessment> {
        self.latest.as_ref()
    }
}
