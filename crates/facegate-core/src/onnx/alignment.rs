//! Landmark-driven face alignment onto the 112×112 ArcFace canvas.

/// InsightFace reference points for a 112×112 crop, in detector landmark
/// order: eye, eye, nose, mouth corner, mouth corner (image left first).
pub const ARCFACE_REFERENCE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIDE: usize = 112;

/// 2D similarity transform `p' = [a -b; b a] p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit mapping `src` onto `dst`.
    ///
    /// Closed form on mean-centred points. Degenerate input (all source
    /// points coincident) yields the identity.
    pub fn fit(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Self {
        let n = src.len().min(dst.len());
        if n == 0 {
            return Self::IDENTITY;
        }

        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }
        if energy < 1e-9 {
            return Self::IDENTITY;
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }
}

/// Bilinear sample of a luminance plane; outside pixels read as black.
fn sample(gray: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let at = |xi: i64, yi: i64| -> f32 {
        if xi < 0 || yi < 0 || xi >= width as i64 || yi >= height as i64 {
            0.0
        } else {
            gray[yi as usize * width + xi as usize] as f32
        }
    };
    let (xi, yi) = (x0 as i64, y0 as i64);
    let top = at(xi, yi) * (1.0 - fx) + at(xi + 1, yi) * fx;
    let bottom = at(xi, yi + 1) * (1.0 - fx) + at(xi + 1, yi + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Warp the face described by `landmarks` onto the ArcFace canvas.
pub fn align(gray: &[u8], width: usize, height: usize, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let forward = Similarity::fit(landmarks, &ARCFACE_REFERENCE);
    let Some(back) = forward.inverse() else {
        return vec![0; ALIGNED_SIDE * ALIGNED_SIDE];
    };

    let mut out = Vec::with_capacity(ALIGNED_SIDE * ALIGNED_SIDE);
    for oy in 0..ALIGNED_SIDE {
        for ox in 0..ALIGNED_SIDE {
            let (sx, sy) = back.apply((ox as f32, oy as f32));
            out.push(sample(gray, width, height, sx, sy).round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}
