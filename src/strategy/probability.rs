use super::ProbabilityMethod;
use crate::model::{Fire, Source};

/// Every fire of a source is as likely as the source's false-alarm rate allows.
pub struct DefaultProbability {
    probability: f64,
}

impl DefaultProbability {
    pub fn new(source: &Source) -> Self {
        Self {
            probability: (1.0 - source.default_weighting.false_alarm_rate).clamp(0.0, 1.0),
        }
    }
}

impl ProbabilityMethod for DefaultProbability {
    fn fire_probability(&self, _fire: &Fire) -> f64 {
        self.probability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement_of_false_alarm_rate() {
        let mut source = Source::new("modis", "MODIS");
        source.default_weighting.false_alarm_rate = 0.25;
        let fire = Fire::new(source.id.clone());
        assert_eq!(DefaultProbability::new(&source).fire_probability(&fire), 0.75);

        source.default_weighting.false_alarm_rate = 1.5;
        assert_eq!(DefaultProbability::new(&source).fire_probability(&fire), 0.0);
    }
}
