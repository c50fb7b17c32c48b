pub type MapId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub map: MapId,
    pub x: u16,
    pub y: u16,
}

/// Inclusive square around a center cell, clamped to the u16 grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub map: MapId,
    pub min_x: u16,
    pub min_y: u16,
    pub max_x: u16,
    pub max_y: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    Northwest,
    West,
    Southwest,
    South,
    Southeast,
    East,
    Northeast,
}

impl Position {
    pub fn new(map: MapId, x: u16, y: u16) -> Self {
        Self { map, x, y }
    }

    pub fn same_map(self, other: Position) -> bool {
        self.map == other.map
    }

    /// Chebyshev distance check, the square the client uses for its view range.
    pub fn within(self, other: Position, radius: u16) -> bool {
        self.map == other.map
            && self.x.abs_diff(other.x) <= radius
            && self.y.abs_diff(other.y) <= radius
    }

    pub fn area(self, radius: u16) -> Area {
        Area {
            map: self.map,
            min_x: self.x.saturating_sub(radius),
            min_y: self.y.saturating_sub(radius),
            max_x: self.x.saturating_add(radius),
            max_y: self.y.saturating_add(radius),
        }
    }
}

impl Area {
    pub fn contains(&self, position: Position) -> bool {
        position.map == self.map
            && position.x >= self.min_x
            && position.x <= self.max_x
            && position.y >= self.min_y
            && position.y <= self.max_y
    }
}

impl Direction {
    /// Client direction index, counter-clockwise from north.
    pub fn to_u8(self) -> u8 {
        match self {
            Direction::North => 0,
            Direction::Northwest => 1,
            Direction::West => 2,
            Direction::Southwest => 3,
            Direction::South => 4,
            Direction::Southeast => 5,
            Direction::East => 6,
            Direction::Northeast => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Direction::North,
            1 => Direction::Northwest,
            2 => Direction::West,
            3 => Direction::Southwest,
            4 => Direction::South,
            5 => Direction::Southeast,
            6 => Direction::East,
            7 => Direction::Northeast,
            _ => return None,
        })
    }
}
