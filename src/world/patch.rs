//! Bezier patch subdivision.
//!
//! Turns a raw control grid from the map file into a renderable mesh. The
//! level-of-detail solution is direction independent, based only on the
//! subdivided distance from the true curve: columns are inserted until the
//! midpoint deviation falls under the subdivision tolerance, approximating
//! points are pushed onto the curve, and collinear rows/columns are culled.

use glam::Vec3;

use crate::math::Bounds;
use crate::vertex::Vertex;

/// Midpoint error tolerance in world units.
const SUBDIVISIONS: f32 = 1.0;

/// Max dimensions of a patch mesh in the map file.
pub const MAX_PATCH_SIZE: usize = 32;

/// Max dimensions of a subdivided grid in memory.
const MAX_GRID_SIZE: usize = 65;

/// A subdivided patch: the grid mesh plus LOD error tables.
#[derive(Debug)]
pub struct Patch {
    pub width: usize,
    pub height: usize,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
    pub width_lod_error: Vec<f32>,
    pub height_lod_error: Vec<f32>,
    pub cull_bounds: Bounds,
    pub cull_origin: Vec3,
    pub cull_radius: f32,
    /// LOD may group curves that subdivide as a unit.
    pub lod_origin: Vec3,
    pub lod_radius: f32,
}

struct Grid {
    width: usize,
    height: usize,
    ctrl: Vec<Vertex>,
}

impl Grid {
    fn get(&self, row: usize, column: usize) -> &Vertex {
        &self.ctrl[row * MAX_GRID_SIZE + column]
    }

    fn set(&mut self, row: usize, column: usize, v: Vertex) {
        self.ctrl[row * MAX_GRID_SIZE + column] = v;
    }

    fn transpose(&mut self) {
        if self.width > self.height {
            for i in 0..self.height {
                for j in i + 1..self.width {
                    if j < self.height {
                        let a = *self.get(j, i);
                        let b = *self.get(i, j);
                        self.set(j, i, b);
                        self.set(i, j, a);
                    } else {
                        let v = *self.get(i, j);
                        self.set(j, i, v);
                    }
                }
            }
        } else {
            for i in 0..self.width {
                for j in i + 1..self.height {
                    if j < self.width {
                        let a = *self.get(i, j);
                        let b = *self.get(j, i);
                        self.set(i, j, b);
                        self.set(j, i, a);
                    } else {
                        let v = *self.get(j, i);
                        self.set(i, j, v);
                    }
                }
            }
        }

        std::mem::swap(&mut self.width, &mut self.height);
    }

    fn invert_columns(&mut self) {
        for i in 0..self.height {
            for j in 0..self.width / 2 {
                let a = *self.get(i, j);
                let b = *self.get(i, self.width - 1 - j);
                self.set(i, j, b);
                self.set(i, self.width - 1 - j, a);
            }
        }
    }
}

fn invert_error_table(error_table: &mut [[f32; MAX_GRID_SIZE]; 2], width: usize, height: usize) {
    let copy = *error_table;

    for i in 0..width {
        error_table[1][i] = copy[0][i];
    }

    for i in 0..height {
        error_table[0][i] = copy[1][height - 1 - i];
    }
}

/// Replace every odd row/column with the Catmull midpoint so all the
/// approximating points end up on the curve.
fn put_points_on_curve(grid: &mut Grid) {
    for i in 0..grid.width {
        let mut j = 1;

        while j < grid.height {
            let prev = Vertex::midpoint(grid.get(j, i), grid.get(j + 1, i));
            let next = Vertex::midpoint(grid.get(j, i), grid.get(j - 1, i));
            grid.set(j, i, Vertex::midpoint(&prev, &next));
            j += 2;
        }
    }

    for j in 0..grid.height {
        let mut i = 1;

        while i < grid.width {
            let prev = Vertex::midpoint(grid.get(j, i), grid.get(j, i + 1));
            let next = Vertex::midpoint(grid.get(j, i), grid.get(j, i - 1));
            grid.set(j, i, Vertex::midpoint(&prev, &next));
            i += 2;
        }
    }
}

/// Smoothed vertex normals, handling wrapped and degenerate edges.
fn make_mesh_normals(grid: &mut Grid) {
    const NEIGHBORS: [(i32, i32); 8] = [
        (0, 1),
        (1, 1),
        (1, 0),
        (1, -1),
        (0, -1),
        (-1, -1),
        (-1, 0),
        (-1, 1),
    ];

    let width = grid.width;
    let height = grid.height;

    let mut wrap_width = true;

    for i in 0..height {
        let delta = grid.get(i, 0).pos() - grid.get(i, width - 1).pos();

        if delta.length_squared() > 1.0 {
            wrap_width = false;
            break;
        }
    }

    let mut wrap_height = true;

    for i in 0..width {
        let delta = grid.get(0, i).pos() - grid.get(height - 1, i).pos();

        if delta.length_squared() > 1.0 {
            wrap_height = false;
            break;
        }
    }

    for i in 0..width {
        for j in 0..height {
            let base = grid.get(j, i).pos();
            let mut around = [Vec3::ZERO; 8];
            let mut good = [false; 8];

            for (k, (dx, dy)) in NEIGHBORS.iter().enumerate() {
                for dist in 1..=3 {
                    let mut x = i as i32 + dx * dist;
                    let mut y = j as i32 + dy * dist;

                    if wrap_width {
                        if x < 0 {
                            x += width as i32 - 1;
                        } else if x >= width as i32 {
                            x += 1 - width as i32;
                        }
                    }

                    if wrap_height {
                        if y < 0 {
                            y += height as i32 - 1;
                        } else if y >= height as i32 {
                            y += 1 - height as i32;
                        }
                    }

                    if x < 0 || x >= width as i32 || y < 0 || y >= height as i32 {
                        break; // edge of patch
                    }

                    let temp = grid.get(y as usize, x as usize).pos() - base;

                    if temp.length_squared() == 0.0 {
                        continue; // degenerate edge, get more distance
                    }

                    good[k] = true;
                    around[k] = temp.normalize();
                    break;
                }
            }

            let mut sum = Vec3::ZERO;

            for k in 0..8 {
                if !good[k] || !good[(k + 1) & 7] {
                    continue; // didn't get two points
                }

                let normal = around[(k + 1) & 7].cross(around[k]);

                if normal.length_squared() == 0.0 {
                    continue;
                }

                sum += normal.normalize();
            }

            let normal = sum.normalize_or(Vec3::Z);
            let mut v = *grid.get(j, i);
            v.set_normal(normal);
            grid.set(j, i, v);
        }
    }
}

fn make_mesh_indices(grid: &Grid) -> Vec<u16> {
    let w = grid.width - 1;
    let h = grid.height - 1;
    let mut indices = Vec::with_capacity(w * h * 6);

    for i in 0..h {
        for j in 0..w {
            // Vertex order to be recognized as tristrips.
            let v1 = (i * grid.width + j + 1) as u16;
            let v2 = v1 - 1;
            let v3 = v2 + grid.width as u16;
            let v4 = v3 + 1;

            indices.extend_from_slice(&[v2, v3, v1, v1, v3, v4]);
        }
    }

    indices
}

/// Subdivide a control grid into a renderable patch.
///
/// Deterministic for a fixed input grid and tolerance.
#[must_use]
pub fn subdivide(width: usize, height: usize, points: &[Vertex]) -> Patch {
    let mut grid = Grid {
        width,
        height,
        ctrl: vec![Vertex::default(); MAX_GRID_SIZE * MAX_GRID_SIZE],
    };

    for i in 0..width {
        for j in 0..height {
            grid.set(j, i, points[j * width + i]);
        }
    }

    let mut error_table = [[0.0f32; MAX_GRID_SIZE]; 2];

    for dir in 0..2 {
        for entry in &mut error_table[dir] {
            *entry = 0.0;
        }

        let mut consecutive_complete = 0usize;

        // Horizontal subdivisions.
        let mut j = 0usize;

        loop {
            // Check subdivided midpoints against control points.
            let mut max_len_sq = 0.0f32;

            for i in 0..grid.height {
                // The point on the curve.
                let p0 = grid.get(i, j).pos();
                let p1 = grid.get(i, j + 1).pos();
                let p2 = grid.get(i, j + 2).pos();
                let mid = (p0 + p1 * 2.0 + p2) * 0.25;

                // Distance from the chord; dist-from-line gives far fewer
                // polygons than dist-from-midpoint.
                let offset = mid - p0;
                let dir = (p2 - p0).normalize_or_zero();
                let projected = dir * offset.dot(dir);
                max_len_sq = max_len_sq.max((offset - projected).length_squared());
            }

            let max_len = max_len_sq.sqrt();

            // If all the points are on the lines, the column can be removed
            // entirely later.
            if max_len < 0.1 {
                error_table[dir][j + 1] = 999.0;
                consecutive_complete += 1;

                if consecutive_complete >= grid.width {
                    break;
                }

                j = (j + 2) % (grid.width - 1);
                continue;
            }

            if grid.width + 2 > MAX_GRID_SIZE {
                error_table[dir][j + 1] = 1.0 / max_len;
                break; // can't subdivide any more
            }

            if max_len <= SUBDIVISIONS {
                error_table[dir][j + 1] = 1.0 / max_len;
                consecutive_complete += 1;

                if consecutive_complete >= grid.width {
                    break;
                }

                j = (j + 2) % (grid.width - 1);
                continue; // didn't need subdivision
            }

            error_table[dir][j + 2] = 1.0 / max_len;
            consecutive_complete = 0;

            // Insert two columns and replace the peak.
            grid.width += 2;

            for i in 0..grid.height {
                let prev = Vertex::midpoint(grid.get(i, j), grid.get(i, j + 1));
                let next = Vertex::midpoint(grid.get(i, j + 1), grid.get(i, j + 2));
                let mid = Vertex::midpoint(&prev, &next);

                let mut k = grid.width - 1;

                while k > j + 3 {
                    let v = *grid.get(i, k - 2);
                    grid.set(i, k, v);
                    k -= 1;
                }

                grid.set(i, j + 1, prev);
                grid.set(i, j + 2, mid);
                grid.set(i, j + 3, next);
            }

            // Skip the new columns; they get checked on the next pass.
            j = (j + 4) % (grid.width - 1);
        }

        grid.transpose();
    }

    // Put all the approximating points on the curve.
    put_points_on_curve(&mut grid);

    // Cull out any rows or columns that are colinear.
    let mut i = 1;

    while i + 1 < grid.width {
        if error_table[0][i] != 999.0 {
            i += 1;
            continue;
        }

        for j in i + 1..grid.width {
            for k in 0..grid.height {
                let v = *grid.get(k, j);
                grid.set(k, j - 1, v);
            }

            error_table[0][j - 1] = error_table[0][j];
        }

        grid.width -= 1;
    }

    let mut i = 1;

    while i + 1 < grid.height {
        if error_table[1][i] != 999.0 {
            i += 1;
            continue;
        }

        for j in i + 1..grid.height {
            for k in 0..grid.width {
                let v = *grid.get(j, k);
                grid.set(j - 1, k, v);
            }

            error_table[1][j - 1] = error_table[1][j];
        }

        grid.height -= 1;
    }

    // Flip for the longest tristrips as an optimization; the results are
    // visually identical either way.
    if grid.height > grid.width {
        invert_error_table(&mut error_table, grid.width, grid.height);
        grid.transpose();
        grid.invert_columns();
    }

    let indices = make_mesh_indices(&grid);
    make_mesh_normals(&mut grid);

    // Copy the results out to a tight grid.
    let mut vertices = Vec::with_capacity(grid.width * grid.height);
    let mut cull_bounds = Bounds::EMPTY;

    for j in 0..grid.height {
        for i in 0..grid.width {
            let v = *grid.get(j, i);
            cull_bounds.add_point(v.pos());
            vertices.push(v);
        }
    }

    let cull_origin = cull_bounds.midpoint();
    let cull_radius = (cull_bounds.min - cull_origin).length();

    Patch {
        width: grid.width,
        height: grid.height,
        vertices,
        indices,
        width_lod_error: error_table[0][..grid.width].to_vec(),
        height_lod_error: error_table[1][..grid.height].to_vec(),
        cull_bounds,
        cull_origin,
        cull_radius,
        lod_origin: cull_origin,
        lod_radius: cull_radius,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_vertex(x: f32, y: f32, z: f32) -> Vertex {
        let mut v = Vertex::default();
        v.set_pos(Vec3::new(x, y, z));
        v.set_tex_coord(x / 10.0, y / 10.0, 0.0, 0.0);
        v.color = [255, 255, 255, 255];
        v
    }

    fn curved_3x3() -> Vec<Vertex> {
        // A 3x3 control grid bulging along z.
        let mut points = Vec::new();

        for j in 0..3 {
            for i in 0..3 {
                let bulge = if i == 1 || j == 1 { 20.0 } else { 0.0 };
                points.push(control_vertex(i as f32 * 50.0, j as f32 * 50.0, bulge));
            }
        }

        points
    }

    #[test]
    fn subdivision_is_deterministic() {
        let points = curved_3x3();
        let a = subdivide(3, 3, &points);
        let b = subdivide(3, 3, &points);
        assert_eq!(a.width, b.width);
        assert_eq!(a.height, b.height);
        assert_eq!(a.indices, b.indices);

        for (va, vb) in a.vertices.iter().zip(&b.vertices) {
            assert_eq!(va.position, vb.position);
        }
    }

    #[test]
    fn curved_grid_subdivides() {
        let patch = subdivide(3, 3, &curved_3x3());
        assert!(patch.width >= 3);
        assert!(patch.height >= 3);
        assert_eq!(patch.vertices.len(), patch.width * patch.height);
        assert_eq!(patch.indices.len(), (patch.width - 1) * (patch.height - 1) * 6);

        // All indices must address the grid.
        for &index in &patch.indices {
            assert!((index as usize) < patch.vertices.len());
        }
    }

    #[test]
    fn flat_grid_collapses_to_corners() {
        // A perfectly flat grid needs no interior columns.
        let mut points = Vec::new();

        for j in 0..3 {
            for i in 0..3 {
                points.push(control_vertex(i as f32 * 50.0, j as f32 * 50.0, 0.0));
            }
        }

        let patch = subdivide(3, 3, &points);
        assert_eq!(patch.width, 2);
        assert_eq!(patch.height, 2);
    }

    #[test]
    fn bounds_contain_all_vertices() {
        let patch = subdivide(3, 3, &curved_3x3());

        for v in &patch.vertices {
            let p = v.pos();
            assert!(p.x >= patch.cull_bounds.min.x - 1e-3);
            assert!(p.cmple(patch.cull_bounds.max + Vec3::splat(1e-3)).all());
        }
    }
}
