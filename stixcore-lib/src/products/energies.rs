use serde::{Deserialize, Serialize};

use super::Control;
use crate::{Error, Result};

/// Science energy channel edges in keV. The upper edge of the last channel is open.
const CHANNEL_EDGES: [f64; 33] = [
    0.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 18.0, 20.0,
    22.0, 25.0, 28.0, 32.0, 36.0, 40.0, 45.0, 50.0, 56.0, 63.0, 70.0, 76.0, 84.0, 100.0, 120.0,
    150.0, f64::INFINITY,
];

/// Energy channel table of a product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Energies {
    pub channel: Vec<u32>,
    pub e_low: Vec<f64>,
    /// `None` marks an open upper edge.
    pub e_high: Vec<Option<f64>>,
}

impl Energies {
    #[must_use]
    pub fn len(&self) -> usize {
        self.channel.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    /// Channels described by an energy bin mask.
    ///
    /// With no mask the 32 science channels are returned. A 33 element mask marks channel
    /// edges, so consecutive set edges bound one channel. A 32 element mask marks channels,
    /// and every channel between the first and last set one is returned.
    ///
    /// # Errors
    /// [Error::Schema] if the mask has a different length.
    pub fn from_mask(mask: Option<&[bool]>) -> Result<Self> {
        let bounds: Vec<(usize, usize)> = match mask {
            None => (0..32).map(|c| (c, c + 1)).collect(),
            Some(mask) if mask.len() == 33 => {
                let edges: Vec<usize> = (0..33).filter(|i| mask[*i]).collect();
                edges.windows(2).map(|w| (w[0], w[1])).collect()
            }
            Some(mask) if mask.len() == 32 => {
                let set: Vec<usize> = (0..32).filter(|i| mask[*i]).collect();
                match (set.first(), set.last()) {
                    (Some(lo), Some(hi)) => (*lo..=*hi).map(|c| (c, c + 1)).collect(),
                    _ => Vec::new(),
                }
            }
            Some(mask) => {
                return Err(Error::Schema(format!(
                    "energy mask must have a length of 32 or 33, not {}",
                    mask.len()
                )))
            }
        };

        let mut energies = Energies::default();
        for (i, (lo, hi)) in bounds.into_iter().enumerate() {
            energies.channel.push(i as u32);
            energies.e_low.push(CHANNEL_EDGES[lo]);
            let high = CHANNEL_EDGES[hi];
            energies.e_high.push(high.is_finite().then_some(high));
        }
        Ok(energies)
    }

    /// Channels for a product's control table, using the first `energy_bin_edge_mask` row if
    /// present.
    ///
    /// # Errors
    /// [Error::Schema] if the stored mask is malformed.
    pub fn for_control(control: &Control) -> Result<Self> {
        match control.extra.get("energy_bin_edge_mask") {
            Some(col) if control.len() > 0 => {
                let mask: Vec<bool> = (0..col.width)
                    .map(|i| col.values.u64_at(i).unwrap_or_default() == 1)
                    .collect();
                Self::from_mask(Some(&mask))
            }
            _ => Self::from_mask(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_channels() {
        let e = Energies::from_mask(None).unwrap();
        assert_eq!(e.len(), 32);
        assert_eq!(e.e_low[0], 0.0);
        assert_eq!(e.e_high[0], Some(4.0));
        assert_eq!(e.e_high[31], None);
    }

    #[test]
    fn edge_mask() {
        let mut mask = [false; 33];
        mask[1] = true;
        mask[3] = true;
        mask[10] = true;
        let e = Energies::from_mask(Some(&mask)).unwrap();
        assert_eq!(e.e_low, vec![4.0, 6.0]);
        assert_eq!(e.e_high, vec![Some(6.0), Some(13.0)]);
    }

    #[test]
    fn channel_mask() {
        let mut mask = [false; 32];
        mask[2] = true;
        mask[4] = true;
        let e = Energies::from_mask(Some(&mask)).unwrap();
        assert_eq!(e.channel, vec![0, 1, 2]);
        assert_eq!(e.e_low, vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn bad_mask() {
        assert!(Energies::from_mask(Some(&[true; 5])).is_err());
    }
}
